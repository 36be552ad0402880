//! Scheduler / run loop: drives workflow nodes to terminal status while
//! honoring dependencies, branch pruning, loops, timeouts, and interrupt.
//!
//! Concurrency model: node executors run as independent tasks, but every
//! status transition, prune decision, and loop-tick count lives on one
//! coordination task per execution. Executor tasks talk back over a single
//! mpsc channel, tagged by node id, so branch pruning is race-free by
//! construction.

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::ApprovalCoordinator;
use crate::bus::ExecutionBus;
use crate::config::LatticeConfig;
use crate::error::{ErrorCode, ExecutionError};
use crate::event::ExecutionEvent;
use crate::evolution::EvolutionApplier;
use crate::executor::{
    public_result, AgentPool, AgentServiceFactory, ExecutorContext, ExecutorEmit,
    ExecutorOutcome, ExecutorRegistry,
};
use crate::replay::ReplayPlan;
use crate::sandbox::SandboxSet;
use crate::storage::{ExecutionStatus, ExecutionStore, ExecutionSummary, NodeSummary, WorkflowStore};
use crate::validator::{validate_workflow, ValidationReport};
use crate::workflow::{MergeStrategy, NodeConfig, NodeOutput, NodeStatus, NodeType, Workflow};

/// Grace period for in-flight executors to surface their interrupt errors
/// before the run is torn down.
const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Engine & handles
// ---------------------------------------------------------------------------

/// Outcome of asking the engine to start a run.
pub enum StartOutcome {
    Started(ExecutionHandle),
    /// Pre-flight failed; `validation-error` was published and no run began.
    Invalid(ValidationReport),
}

/// Handle to a running execution.
pub struct ExecutionHandle {
    pub execution_id: String,
    cancel: Arc<watch::Sender<bool>>,
    done: oneshot::Receiver<Result<Value, ExecutionError>>,
}

impl ExecutionHandle {
    /// Trip the run-level cancellation signal.
    pub fn interrupt(&self) {
        let _ = self.cancel.send(true);
    }

    /// A detachable interrupter for use from other tasks.
    pub fn interrupter(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.cancel)
    }

    /// Wait for the run's terminal result.
    pub async fn wait(self) -> Result<Value, ExecutionError> {
        self.done.await.unwrap_or_else(|_| {
            Err(ExecutionError::new(
                ErrorCode::ExecutionFailed,
                "execution task dropped without a result",
            ))
        })
    }
}

/// The execution engine: owns the bus, the approval coordinator, and the
/// collaborator handles every run shares.
pub struct Engine {
    config: Arc<LatticeConfig>,
    registry: Arc<ExecutorRegistry>,
    bus: Arc<ExecutionBus>,
    approvals: ApprovalCoordinator,
    factory: Arc<dyn AgentServiceFactory>,
    sandboxes: Arc<SandboxSet>,
    workflow_store: Arc<dyn WorkflowStore>,
    execution_store: Arc<dyn ExecutionStore>,
    /// Live runs' cancellation handles, keyed by execution id.
    running: Arc<Mutex<HashMap<String, Arc<watch::Sender<bool>>>>>,
}

impl Engine {
    pub fn new(
        config: LatticeConfig,
        factory: Arc<dyn AgentServiceFactory>,
        sandboxes: Arc<SandboxSet>,
        workflow_store: Arc<dyn WorkflowStore>,
        execution_store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let subscriber_capacity = config.general.subscriber_queue_capacity;
        Self {
            config: Arc::new(config),
            registry: Arc::new(ExecutorRegistry::standard()),
            bus: Arc::new(ExecutionBus::new(subscriber_capacity)),
            approvals: ApprovalCoordinator::new(),
            factory,
            sandboxes,
            workflow_store,
            execution_store,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bus(&self) -> Arc<ExecutionBus> {
        Arc::clone(&self.bus)
    }

    pub fn approvals(&self) -> ApprovalCoordinator {
        self.approvals.clone()
    }

    pub fn workflow_store(&self) -> Arc<dyn WorkflowStore> {
        Arc::clone(&self.workflow_store)
    }

    pub fn execution_store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.execution_store)
    }

    /// Interrupt a running execution by id. Returns `false` when unknown.
    pub fn interrupt(&self, execution_id: &str) -> bool {
        match self.running.lock().unwrap().get(execution_id) {
            Some(cancel) => {
                let _ = cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Subscribe to an execution's event stream, replaying journaled events
    /// newer than `after` first. Falls back to the durable journal for
    /// executions from a previous process.
    pub async fn subscribe(
        &self,
        execution_id: &str,
        after: Option<chrono::DateTime<Utc>>,
    ) -> mpsc::Receiver<crate::event::ExecutionEventRecord> {
        if self.bus.journal(execution_id).is_empty() {
            if let Ok(events) = self.execution_store.load_events(execution_id).await {
                if !events.is_empty() {
                    self.bus.restore(execution_id, events, true);
                }
            }
        }
        self.bus.subscribe(execution_id, after)
    }

    /// Validate and start a run.
    pub async fn start(&self, workflow: Workflow, input: String) -> StartOutcome {
        self.start_inner(workflow, input, None).await
    }

    /// Start a partial run seeded from a replay plan.
    pub async fn start_replay(
        &self,
        workflow: Workflow,
        input: String,
        plan: ReplayPlan,
    ) -> StartOutcome {
        self.start_inner(workflow, input, Some(plan)).await
    }

    async fn start_inner(
        &self,
        workflow: Workflow,
        input: String,
        plan: Option<ReplayPlan>,
    ) -> StartOutcome {
        let execution_id = Uuid::new_v4().to_string();

        let report = validate_workflow(&workflow);
        if !report.valid {
            // Surface to any observer of this (never-started) execution.
            self.bus.publish(
                &execution_id,
                ExecutionEvent::ValidationError {
                    errors: report.errors.clone(),
                },
            );
            self.bus.close(&execution_id);
            return StartOutcome::Invalid(report);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (done_tx, done_rx) = oneshot::channel();

        self.running
            .lock()
            .unwrap()
            .insert(execution_id.clone(), Arc::clone(&cancel_tx));

        let run = ExecutionRun {
            execution_id: execution_id.clone(),
            workflow: Arc::new(workflow),
            input,
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            approvals: self.approvals.clone(),
            agents: Arc::new(AgentPool::new(Arc::clone(&self.factory))),
            sandboxes: Arc::clone(&self.sandboxes),
            applier: Arc::new(EvolutionApplier::new(Arc::clone(&self.workflow_store))),
            execution_store: Arc::clone(&self.execution_store),
            cancel: cancel_rx,
        };

        let running = Arc::clone(&self.running);
        let finished_id = execution_id.clone();
        tokio::spawn(async move {
            let result = run.drive(plan).await;
            running.lock().unwrap().remove(&finished_id);
            let _ = done_tx.send(result);
        });

        StartOutcome::Started(ExecutionHandle {
            execution_id,
            cancel: cancel_tx,
            done: done_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

enum NodeMsg {
    Emit {
        node_id: String,
        emit: ExecutorEmit,
    },
    Done {
        node_id: String,
        outcome: ExecutorOutcome,
    },
}

struct ExecutionRun {
    execution_id: String,
    workflow: Arc<Workflow>,
    input: String,
    config: Arc<LatticeConfig>,
    registry: Arc<ExecutorRegistry>,
    bus: Arc<ExecutionBus>,
    approvals: ApprovalCoordinator,
    agents: Arc<AgentPool>,
    sandboxes: Arc<SandboxSet>,
    applier: Arc<EvolutionApplier>,
    execution_store: Arc<dyn ExecutionStore>,
    cancel: watch::Receiver<bool>,
}

struct RunState {
    status: HashMap<String, NodeStatus>,
    outputs: HashMap<String, NodeOutput>,
    /// Edge ids pruned by condition/approval decisions.
    pruned: HashSet<String>,
    /// Loop back-edges: they never gate readiness, they only re-arm their
    /// target when taken.
    back_edges: HashSet<String>,
    /// Times each node has been started this execution.
    ticks: HashMap<String, u32>,
    running: HashMap<String, tokio::task::JoinHandle<()>>,
    started_at: chrono::DateTime<Utc>,
}

/// Classify loop back-edges with a three-color DFS from the input node: an
/// edge into a node still on the visiting stack closes a cycle.
fn compute_back_edges(workflow: &Workflow) -> HashSet<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    let Some(input) = workflow.input_node() else {
        return HashSet::new();
    };

    let mut marks: HashMap<&str, Mark> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), Mark::White))
        .collect();
    let mut back = HashSet::new();

    // Stack frames: (node, outgoing edges not yet explored).
    let mut stack: Vec<(&str, Vec<&crate::workflow::Edge>)> =
        vec![(input.id.as_str(), workflow.edges_from(&input.id))];
    marks.insert(input.id.as_str(), Mark::Grey);

    loop {
        let next = match stack.last_mut() {
            None => break,
            Some((_, edges)) => edges.pop(),
        };
        match next {
            Some(edge) => {
                let target = edge.target.as_str();
                match marks.get(target) {
                    Some(Mark::Grey) => {
                        back.insert(edge.id.clone());
                    }
                    Some(Mark::White) => {
                        marks.insert(target, Mark::Grey);
                        stack.push((target, workflow.edges_from(target)));
                    }
                    _ => {}
                }
            }
            None => {
                if let Some((node, _)) = stack.pop() {
                    marks.insert(node, Mark::Black);
                }
            }
        }
    }
    back
}

impl ExecutionRun {
    async fn publish(&self, event: ExecutionEvent) {
        if let Some(record) = self.bus.publish(&self.execution_id, event) {
            if let Err(e) = self
                .execution_store
                .append_events(&self.execution_id, std::slice::from_ref(&record))
                .await
            {
                warn!(execution_id = %self.execution_id, %e, "failed to journal event");
            }
        }
    }

    async fn persist_summary(&self, state: &RunState, status: ExecutionStatus, result: Option<Value>) {
        let summary = ExecutionSummary {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow.id.clone(),
            status,
            input: self.input.clone(),
            final_result: result,
            nodes: state
                .status
                .iter()
                .map(|(id, node_status)| {
                    let output = state.outputs.get(id);
                    (
                        id.clone(),
                        NodeSummary {
                            status: *node_status,
                            started_at: output.and_then(|o| o.started_at),
                            completed_at: output.and_then(|o| o.completed_at),
                            result: output.and_then(|o| o.result.clone()),
                        },
                    )
                })
                .collect(),
            started_at: state.started_at,
            completed_at: match status {
                ExecutionStatus::Running => None,
                _ => Some(Utc::now()),
            },
        };
        if let Err(e) = self.execution_store.save_summary(&summary).await {
            warn!(execution_id = %self.execution_id, %e, "failed to persist execution summary");
        }
    }

    /// The coordination task: everything that mutates run state runs here.
    async fn drive(mut self, plan: Option<ReplayPlan>) -> Result<Value, ExecutionError> {
        let (msg_tx, mut msg_rx) = mpsc::channel::<NodeMsg>(self.config.general.event_channel_capacity);

        let mut state = RunState {
            status: self
                .workflow
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeStatus::Pending))
                .collect(),
            outputs: HashMap::new(),
            pruned: HashSet::new(),
            back_edges: compute_back_edges(&self.workflow),
            ticks: HashMap::new(),
            running: HashMap::new(),
            started_at: Utc::now(),
        };

        info!(
            execution_id = %self.execution_id,
            workflow = %self.workflow.name,
            node_count = self.workflow.nodes.len(),
            "starting execution"
        );

        self.publish(ExecutionEvent::ExecutionStart {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow.id.clone(),
        })
        .await;

        // Replay seeding: reused ancestors start the run already complete.
        if let Some(plan) = plan {
            for (node_id, result) in plan.reused {
                if let Some(node) = self.workflow.node(&node_id) {
                    state.status.insert(node_id.clone(), NodeStatus::Complete);
                    let mut output = NodeOutput::new(node.name());
                    output.result = Some(result);
                    output.run_count = 1;
                    state.outputs.insert(node_id, output);
                }
            }
            for warning in plan.warnings {
                debug!(execution_id = %self.execution_id, warning, "replay drift");
            }
        }

        self.persist_summary(&state, ExecutionStatus::Running, None).await;

        let result = self.run_loop(&mut state, &msg_tx, &mut msg_rx).await;

        match &result {
            Ok(value) => {
                self.publish(ExecutionEvent::ExecutionComplete {
                    result: value.clone(),
                })
                .await;
                self.persist_summary(&state, ExecutionStatus::Complete, Some(value.clone()))
                    .await;
            }
            Err(error) => {
                self.publish(ExecutionEvent::ExecutionError {
                    error: error.clone(),
                })
                .await;
                self.persist_summary(&state, ExecutionStatus::Error, None).await;
            }
        }
        self.bus.close(&self.execution_id);

        // Nothing should outlive the run.
        for (_, handle) in state.running.drain() {
            handle.abort();
        }

        info!(
            execution_id = %self.execution_id,
            ok = result.is_ok(),
            "execution finished"
        );
        result
    }

    async fn run_loop(
        &mut self,
        state: &mut RunState,
        msg_tx: &mpsc::Sender<NodeMsg>,
        msg_rx: &mut mpsc::Receiver<NodeMsg>,
    ) -> Result<Value, ExecutionError> {
        let output_id = self
            .workflow
            .output_node()
            .map(|n| n.id.clone())
            .expect("validated workflow has an output node");

        // One receiver for the whole loop so a signal sent at any point
        // after this line is never missed.
        let mut cancel = self.cancel.clone();

        loop {
            if *cancel.borrow() {
                return Err(self.handle_interrupt(state, msg_rx).await);
            }

            if let Err(error) = self.schedule_ready(state, msg_tx).await {
                self.abort_everything(state).await;
                return Err(error);
            }

            // Terminal checks.
            if state.status.get(&output_id) == Some(&NodeStatus::Complete) {
                let result = state
                    .outputs
                    .get(&output_id)
                    .and_then(|o| o.result.as_ref())
                    .map(public_result)
                    .unwrap_or(Value::Null);
                self.abort_everything(state).await;
                return Ok(result);
            }

            let all_terminal = state.status.values().all(|s| s.is_terminal());
            if all_terminal {
                return Err(ExecutionError::new(
                    ErrorCode::NoValidPath,
                    "no valid path reached the output node",
                ));
            }

            if state.running.is_empty() {
                // Nothing in flight and nothing schedulable: prune what the
                // graph can no longer reach and re-check.
                self.propagate_skips(state);
                if state.status.values().all(|s| s.is_terminal()) {
                    continue;
                }
                if !self.any_ready(state) {
                    return Err(ExecutionError::new(
                        ErrorCode::NoValidPath,
                        "execution stalled before reaching the output node",
                    ));
                }
                continue;
            }

            tokio::select! {
                biased;

                // The loop-top check picks the signal up next iteration.
                _ = cancel.changed() => {}

                msg = msg_rx.recv() => {
                    let Some(msg) = msg else { continue };
                    if let Some(fatal) = self.handle_msg(state, msg).await {
                        self.abort_everything(state).await;
                        return Err(fatal);
                    }
                }
            }
        }
    }

    /// Run-level interrupt: stop agents, unblock approvals, give executors a
    /// grace period to surface their errors, then fail the run.
    async fn handle_interrupt(
        &mut self,
        state: &mut RunState,
        msg_rx: &mut mpsc::Receiver<NodeMsg>,
    ) -> ExecutionError {
        warn!(execution_id = %self.execution_id, "execution interrupted");
        self.agents.interrupt_all().await;
        self.approvals.cancel_all(&self.execution_id);

        let deadline = tokio::time::Instant::now() + INTERRUPT_GRACE;
        while !state.running.is_empty() {
            let msg = tokio::time::timeout_at(deadline, msg_rx.recv()).await;
            match msg {
                Ok(Some(NodeMsg::Done { node_id, outcome })) => {
                    state.running.remove(&node_id);
                    let error = match outcome.result {
                        Err(error) => error,
                        Ok(_) => ExecutionError::interrupted().with_node(&node_id),
                    };
                    self.record_node_error(state, &node_id, error).await;
                }
                Ok(Some(NodeMsg::Emit { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }

        // Whatever did not wind down in time is cut off.
        let leftover: Vec<_> = state.running.drain().collect();
        for (node_id, handle) in leftover {
            handle.abort();
            self.record_node_error(
                state,
                &node_id,
                ExecutionError::interrupted().with_node(&node_id),
            )
            .await;
        }

        ExecutionError::new(ErrorCode::AgentInterrupted, "Execution interrupted")
    }

    async fn abort_everything(&self, state: &mut RunState) {
        if state.running.is_empty() {
            return;
        }
        self.agents.interrupt_all().await;
        self.approvals.cancel_all(&self.execution_id);
        for (_, handle) in state.running.drain() {
            handle.abort();
        }
    }

    /// Record a node error event and status without deciding run fate.
    async fn record_node_error(
        &self,
        state: &mut RunState,
        node_id: &str,
        error: ExecutionError,
    ) {
        state.status.insert(node_id.to_string(), NodeStatus::Error);
        if let Some(output) = state.outputs.get_mut(node_id) {
            output.error = Some(error.message.clone());
            output.completed_at = Some(Utc::now());
        }
        self.publish(ExecutionEvent::NodeError {
            node_id: node_id.to_string(),
            error,
        })
        .await;
    }

    /// Handle one executor message. Returns a fatal error when the run must
    /// abort.
    async fn handle_msg(&mut self, state: &mut RunState, msg: NodeMsg) -> Option<ExecutionError> {
        match msg {
            NodeMsg::Emit { node_id, emit } => {
                match emit {
                    ExecutorEmit::Agent(event) => {
                        if let Some(output) = state.outputs.get_mut(&node_id) {
                            output.events.push(event.clone());
                        }
                        self.publish(ExecutionEvent::NodeOutput { node_id, event }).await;
                    }
                    ExecutorEmit::Waiting(approval) => {
                        state.status.insert(node_id.clone(), NodeStatus::Waiting);
                        self.publish(ExecutionEvent::NodeWaiting { node_id, approval })
                            .await;
                    }
                    ExecutorEmit::Evolution {
                        evolution,
                        applied,
                        approval_requested,
                        validation_errors,
                    } => {
                        self.publish(ExecutionEvent::NodeEvolution {
                            node_id,
                            evolution,
                            applied,
                            approval_requested,
                            validation_errors,
                        })
                        .await;
                    }
                    ExecutorEmit::WorkflowUpdated(workflow) => {
                        // Re-snapshot: nodes pulled from the ready set after
                        // this point see the evolved definition.
                        debug!(execution_id = %self.execution_id, "workflow re-snapshotted after evolution");
                        self.workflow = Arc::new(workflow);
                        state.back_edges = compute_back_edges(&self.workflow);
                        for node in &self.workflow.nodes {
                            state
                                .status
                                .entry(node.id.clone())
                                .or_insert(NodeStatus::Pending);
                        }
                        state.status.retain(|id, _| self.workflow.node(id).is_some());
                    }
                }
                None
            }
            NodeMsg::Done { node_id, outcome } => {
                state.running.remove(&node_id);
                match outcome.result {
                    Ok(result) => {
                        self.complete_node(state, &node_id, result, outcome.handle)
                            .await;
                        None
                    }
                    Err(error) => {
                        let recoverable = error.recoverable;
                        self.record_node_error(state, &node_id, error.clone()).await;
                        if !recoverable {
                            return Some(error);
                        }
                        self.propagate_skips(state);
                        // Recoverable: the run continues only while the
                        // output node can still be reached.
                        let output_alive = self
                            .workflow
                            .output_node()
                            .map(|n| self.live_reachable(state).contains(&n.id))
                            .unwrap_or(false);
                        if output_alive {
                            None
                        } else {
                            Some(ExecutionError::new(
                                ErrorCode::NoValidPath,
                                format!("node '{node_id}' failed and no alternate path reaches the output"),
                            ))
                        }
                    }
                }
            }
        }
    }

    async fn complete_node(
        &mut self,
        state: &mut RunState,
        node_id: &str,
        result: Value,
        handle: Option<String>,
    ) {
        state
            .status
            .insert(node_id.to_string(), NodeStatus::Complete);
        if let Some(output) = state.outputs.get_mut(node_id) {
            output.result = Some(result.clone());
            output.error = None;
            output.completed_at = Some(Utc::now());
        }

        self.publish(ExecutionEvent::NodeComplete {
            node_id: node_id.to_string(),
            result: public_result(&result),
        })
        .await;

        // Handle-based fan-out: edges whose label disagrees with the
        // decision are pruned; agreeing and unlabeled edges stay live.
        if let Some(decision) = handle {
            for edge in self.workflow.edges_from(node_id) {
                if let Some(label) = &edge.source_handle {
                    if *label != decision {
                        state.pruned.insert(edge.id.clone());
                    } else {
                        state.pruned.remove(&edge.id);
                    }
                }
            }
        }

        // Loop re-entry: a live edge into an already-terminal node re-arms
        // it (and clears its stale branch decisions). Skipped targets come
        // back when a later iteration un-prunes their path.
        let rearm: Vec<String> = self
            .workflow
            .edges_from(node_id)
            .into_iter()
            .filter(|e| !state.pruned.contains(&e.id))
            .filter(|e| {
                matches!(
                    state.status.get(&e.target),
                    Some(NodeStatus::Complete) | Some(NodeStatus::Skipped)
                )
            })
            .map(|e| e.target.clone())
            .collect();
        for target in rearm {
            debug!(execution_id = %self.execution_id, node_id = %target, "re-arming loop node");
            state.status.insert(target.clone(), NodeStatus::Pending);
            for edge in self.workflow.edges_from(&target) {
                state.pruned.remove(&edge.id);
            }
        }

        self.propagate_skips(state);
    }

    /// Nodes reachable from the input through non-pruned edges whose source
    /// has not failed or been skipped.
    fn live_reachable(&self, state: &RunState) -> HashSet<String> {
        let Some(input) = self.workflow.input_node() else {
            return HashSet::new();
        };
        let mut reach = HashSet::new();
        let mut queue = VecDeque::new();
        reach.insert(input.id.clone());
        queue.push_back(input.id.clone());

        while let Some(current) = queue.pop_front() {
            let blocked = matches!(
                state.status.get(&current),
                Some(NodeStatus::Error) | Some(NodeStatus::Skipped)
            );
            if blocked {
                continue;
            }
            for edge in self.workflow.edges_from(&current) {
                if state.pruned.contains(&edge.id) {
                    continue;
                }
                if self.workflow.node(&edge.target).is_some() && reach.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        reach
    }

    /// Transitive prune: pending nodes that no live path can reach become
    /// skipped.
    fn propagate_skips(&self, state: &mut RunState) {
        let reach = self.live_reachable(state);
        for node in &self.workflow.nodes {
            if state.status.get(&node.id) == Some(&NodeStatus::Pending)
                && !reach.contains(&node.id)
            {
                debug!(execution_id = %self.execution_id, node_id = %node.id, "skipping unreachable node");
                state.status.insert(node.id.clone(), NodeStatus::Skipped);
                state
                    .outputs
                    .entry(node.id.clone())
                    .or_insert_with(|| NodeOutput::new(node.name()));
            }
        }
    }

    fn is_ready(&self, state: &RunState, node_id: &str) -> bool {
        if state.status.get(node_id) != Some(&NodeStatus::Pending) {
            return false;
        }

        // Back-edges never gate readiness; they re-arm their target when
        // taken instead.
        let live_preds: Vec<&str> = self
            .workflow
            .edges_to(node_id)
            .into_iter()
            .filter(|e| !state.pruned.contains(&e.id))
            .filter(|e| !state.back_edges.contains(&e.id))
            .filter(|e| self.workflow.node(&e.source).is_some())
            .map(|e| e.source.as_str())
            .collect();

        if live_preds.is_empty() {
            // Only the input node runs without predecessors.
            return self
                .workflow
                .node(node_id)
                .is_some_and(|n| n.node_type == NodeType::Input);
        }

        let first_complete = self
            .workflow
            .node(node_id)
            .is_some_and(|n| matches!(&n.data, NodeConfig::Merge(m) if m.strategy == MergeStrategy::FirstComplete));

        if first_complete {
            return live_preds
                .iter()
                .any(|p| state.status.get(*p) == Some(&NodeStatus::Complete));
        }

        let all_terminal = live_preds
            .iter()
            .all(|p| state.status.get(*p).is_some_and(|s| s.is_terminal()));
        let any_complete = live_preds
            .iter()
            .any(|p| state.status.get(*p) == Some(&NodeStatus::Complete));
        all_terminal && any_complete
    }

    fn any_ready(&self, state: &RunState) -> bool {
        self.workflow
            .nodes
            .iter()
            .any(|n| self.is_ready(state, &n.id))
    }

    /// Upstream snapshot for a node: live completed predecessors keyed by
    /// display name.
    fn upstream_snapshot(
        &self,
        state: &RunState,
        node_id: &str,
    ) -> (HashMap<String, Value>, HashMap<String, Vec<crate::event::AgentEvent>>) {
        let mut values = HashMap::new();
        let mut events = HashMap::new();
        for edge in self.workflow.edges_to(node_id) {
            if state.pruned.contains(&edge.id) {
                continue;
            }
            if state.status.get(&edge.source) != Some(&NodeStatus::Complete) {
                continue;
            }
            if let Some(output) = state.outputs.get(&edge.source) {
                if let Some(result) = &output.result {
                    values.insert(output.name.clone(), result.clone());
                }
                events.insert(output.name.clone(), output.events.clone());
            }
        }
        (values, events)
    }

    async fn schedule_ready(
        &mut self,
        state: &mut RunState,
        msg_tx: &mpsc::Sender<NodeMsg>,
    ) -> Result<(), ExecutionError> {
        let ready: Vec<String> = self
            .workflow
            .nodes
            .iter()
            .filter(|n| self.is_ready(state, &n.id))
            .map(|n| n.id.clone())
            .collect();

        for node_id in ready {
            self.spawn_node(state, &node_id, msg_tx).await?;
        }
        Ok(())
    }

    async fn spawn_node(
        &mut self,
        state: &mut RunState,
        node_id: &str,
        msg_tx: &mpsc::Sender<NodeMsg>,
    ) -> Result<(), ExecutionError> {
        // Read the node from the *current* snapshot: a just-applied
        // evolution is visible to nodes pulled from the ready set after it.
        let Some(node) = self.workflow.node(node_id).cloned() else {
            return Ok(());
        };

        let ticks = state.ticks.entry(node_id.to_string()).or_insert(0);
        *ticks += 1;
        if *ticks > self.config.general.max_ticks_per_node {
            return Err(ExecutionError::new(
                ErrorCode::CycleDetected,
                format!(
                    "node '{}' was scheduled more than {} times; unbroken loop",
                    node.name(),
                    self.config.general.max_ticks_per_node
                ),
            )
            .with_node(node_id));
        }

        let Some(executor) = self.registry.executor_for(node.node_type) else {
            let error = ExecutionError::new(
                ErrorCode::UnknownNodeType,
                format!("no executor registered for node type '{}'", node.node_type),
            )
            .with_node(node_id);
            self.record_node_error(state, node_id, error.clone()).await;
            return Err(error);
        };

        if let Some(message) = executor.validate(&node) {
            let error = ExecutionError::new(ErrorCode::ValidationFailed, message)
                .with_node(node_id);
            self.record_node_error(state, node_id, error.clone()).await;
            return Err(error);
        }

        state
            .status
            .insert(node_id.to_string(), NodeStatus::Running);
        let output = state
            .outputs
            .entry(node_id.to_string())
            .or_insert_with(|| NodeOutput::new(node.name()));
        output.name = node.name().to_string();
        output.run_count += 1;
        output.started_at.get_or_insert_with(Utc::now);
        output.completed_at = None;
        let run_count = output.run_count;

        self.publish(ExecutionEvent::NodeStart {
            node_id: node_id.to_string(),
            node_name: node.name().to_string(),
        })
        .await;

        let (upstream, upstream_events) = self.upstream_snapshot(state, node_id);

        // Per-node emit channel, forwarded into the coordinator's single
        // message stream tagged with the node id. The terminal outcome rides
        // the same forwarder, behind every emission, so per-node order is
        // FIFO end to end.
        let (emit_tx, mut emit_rx) = mpsc::channel::<ExecutorEmit>(64);
        let (outcome_tx, outcome_rx) = oneshot::channel::<ExecutorOutcome>();
        let forward_tx = msg_tx.clone();
        let forward_id = node_id.to_string();
        tokio::spawn(async move {
            while let Some(emit) = emit_rx.recv().await {
                if forward_tx
                    .send(NodeMsg::Emit {
                        node_id: forward_id.clone(),
                        emit,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            if let Ok(outcome) = outcome_rx.await {
                let _ = forward_tx
                    .send(NodeMsg::Done {
                        node_id: forward_id,
                        outcome,
                    })
                    .await;
            }
        });

        let ctx = ExecutorContext {
            execution_id: self.execution_id.clone(),
            node_id: node_id.to_string(),
            user_input: self.input.clone(),
            working_directory: self.workflow.working_directory.clone(),
            workflow: Arc::clone(&self.workflow),
            upstream,
            upstream_events,
            emit: emit_tx,
            cancelled: self.cancel.clone(),
            approvals: self.approvals.clone(),
            agents: Arc::clone(&self.agents),
            sandboxes: Arc::clone(&self.sandboxes),
            applier: Some(Arc::clone(&self.applier)),
            config: Arc::clone(&self.config),
            run_count: run_count.saturating_sub(1),
        };

        // Approval expiry belongs to the coordinator (approve/reject/fail);
        // racing it with a wall-clock kill would override the configured
        // action. Everything else gets the per-node or default bound.
        let timeout = match &node.data {
            NodeConfig::Approval(_) => Duration::from_secs(u64::MAX / 1_000),
            other => Duration::from_millis(
                other
                    .timeout_ms()
                    .unwrap_or(self.config.general.default_node_timeout_ms),
            ),
        };
        let task_node_id = node_id.to_string();
        let agents = Arc::clone(&self.agents);

        let handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, executor.execute(&node, &ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Expiry also stops any in-flight agent stream.
                    agents.interrupt_node(&task_node_id).await;
                    ExecutorOutcome::err(
                        ExecutionError::new(
                            ErrorCode::Timeout,
                            format!("node timed out after {}ms", timeout.as_millis()),
                        )
                        .with_node(&task_node_id),
                    )
                }
            };
            // Dropping ctx closes the emit channel; the forwarder relays the
            // outcome only after draining every emission.
            drop(ctx);
            let _ = outcome_tx.send(outcome);
        });

        state.running.insert(node_id.to_string(), handle);
        Ok(())
    }
}
