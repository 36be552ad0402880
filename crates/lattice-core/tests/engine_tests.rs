//! End-to-end engine scenarios driven through scripted agent services.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use lattice_core::agent::ScriptedService;
use lattice_core::config::LatticeConfig;
use lattice_core::error::ErrorCode;
use lattice_core::event::{AgentEvent, ApprovalResponse, ExecutionEvent, ExecutionEventRecord};
use lattice_core::executor::FixedServiceFactory;
use lattice_core::sandbox::{FakeBashSandbox, FakeJsSandbox, SandboxSet};
use lattice_core::scheduler::{Engine, StartOutcome};
use lattice_core::storage::{ExecutionStatus, MemoryExecutionStore, MemoryWorkflowStore};
use lattice_core::workflow::{
    AgentNodeConfig, ApprovalConfig, ApprovalTimeoutAction, ConditionConfig, ConditionOperator,
    ConditionRule, Edge, InputConfig, NodeConfig, NodeStatus, OutputNodeConfig, Position,
    ReflectMode, RuleCombinator, SelfReflectConfig, Workflow, WorkflowNode,
};
use lattice_core::evolution::EvolutionScope;
use lattice_core::workflow::AgentFlavor;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn node(id: &str, config: NodeConfig) -> WorkflowNode {
    WorkflowNode {
        id: id.into(),
        node_type: config.node_type(),
        position: Position { x: 0.0, y: 0.0 },
        data: config,
    }
}

fn edge(id: &str, source: &str, target: &str) -> Edge {
    Edge {
        id: id.into(),
        source: source.into(),
        target: target.into(),
        source_handle: None,
        target_handle: None,
        edge_type: None,
    }
}

fn handled_edge(id: &str, source: &str, target: &str, handle: &str) -> Edge {
    Edge {
        source_handle: Some(handle.into()),
        ..edge(id, source, target)
    }
}

fn agent_node(id: &str, name: &str, query: &str) -> WorkflowNode {
    node(
        id,
        NodeConfig::ClaudeAgent(AgentNodeConfig {
            name: name.into(),
            user_query: query.into(),
            model: None,
            system_prompt: None,
            working_directory: None,
            session_reference: None,
            output_schema: None,
            output_file_path: None,
            timeout_ms: None,
            mcp_servers: vec![],
        }),
    )
}

fn workflow(nodes: Vec<WorkflowNode>, edges: Vec<Edge>) -> Workflow {
    Workflow {
        id: "wf".into(),
        name: "scenario".into(),
        description: None,
        working_directory: None,
        nodes,
        edges,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        evolution_history: None,
    }
}

fn engine_with(turns: Vec<Vec<Value>>) -> (Engine, Arc<ScriptedService>) {
    let service = Arc::new(ScriptedService::new(turns));
    let engine = Engine::new(
        LatticeConfig::default(),
        Arc::new(FixedServiceFactory::new(
            Arc::clone(&service) as Arc<dyn lattice_core::agent::AgentService>
        )),
        Arc::new(SandboxSet {
            bash: Arc::new(FakeBashSandbox::default()),
            js: Arc::new(FakeJsSandbox),
        }),
        Arc::new(MemoryWorkflowStore::new()),
        Arc::new(MemoryExecutionStore::new()),
    );
    (engine, service)
}

fn claude_echo_turn(text: &str) -> Vec<Value> {
    vec![
        json!({"type": "system", "subtype": "init", "session_id": "sess"}),
        json!({"type": "assistant", "message": {"content": [{"type": "text", "text": text}]}}),
        json!({"type": "result", "subtype": "success", "result": text}),
    ]
}

async fn started(engine: &Engine, wf: Workflow, input: &str) -> lattice_core::scheduler::ExecutionHandle {
    match engine.start(wf, input.into()).await {
        StartOutcome::Started(handle) => handle,
        StartOutcome::Invalid(report) => panic!("workflow invalid: {:?}", report.errors),
    }
}

fn event_names(journal: &[ExecutionEventRecord]) -> Vec<String> {
    journal
        .iter()
        .map(|r| match &r.event {
            ExecutionEvent::ExecutionStart { .. } => "execution-start".to_string(),
            ExecutionEvent::NodeStart { node_id, .. } => format!("node-start:{node_id}"),
            ExecutionEvent::NodeOutput { node_id, .. } => format!("node-output:{node_id}"),
            ExecutionEvent::NodeWaiting { node_id, .. } => format!("node-waiting:{node_id}"),
            ExecutionEvent::NodeComplete { node_id, .. } => format!("node-complete:{node_id}"),
            ExecutionEvent::NodeError { node_id, .. } => format!("node-error:{node_id}"),
            ExecutionEvent::ExecutionComplete { .. } => "execution-complete".to_string(),
            ExecutionEvent::ExecutionError { .. } => "execution-error".to_string(),
            ExecutionEvent::ValidationError { .. } => "validation-error".to_string(),
            ExecutionEvent::NodeEvolution { node_id, .. } => format!("node-evolution:{node_id}"),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario 1: linear run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_run_produces_ordered_event_stream() {
    let (engine, _service) = engine_with(vec![claude_echo_turn("hello")]);
    let wf = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            agent_node("agent", "Agent", "Echo: {{Input.prompt}}"),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![edge("e1", "in", "agent"), edge("e2", "agent", "out")],
    );

    let handle = started(&engine, wf, "hello").await;
    let execution_id = handle.execution_id.clone();
    let result = handle.wait().await.unwrap();
    assert_eq!(result, json!("hello"));

    let journal = engine.bus().journal(&execution_id);
    let names = event_names(&journal);
    assert_eq!(names.first().unwrap(), "execution-start");
    assert_eq!(names.last().unwrap(), "execution-complete");

    // Bracketing: node-start(X) < node-output(X) < node-complete(X), and the
    // edge order Input -> Agent -> Output is respected.
    let pos = |name: &str| {
        names
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("missing event {name} in {names:?}"))
    };
    assert!(pos("node-start:in") < pos("node-complete:in"));
    assert!(pos("node-complete:in") < pos("node-start:agent"));
    assert!(pos("node-start:agent") < pos("node-output:agent"));
    assert!(pos("node-output:agent") < pos("node-complete:agent"));
    assert!(pos("node-complete:agent") < pos("node-start:out"));
    assert!(pos("node-complete:out") < pos("execution-complete"));

    // The agent's text-delta stream carried the echoed text.
    let deltas: String = journal
        .iter()
        .filter_map(|r| match &r.event {
            ExecutionEvent::NodeOutput {
                event: AgentEvent::TextDelta { content },
                ..
            } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, "hello");

    // The prompt actually interpolated upstream output.
    let (engine2, service2) = engine_with(vec![claude_echo_turn("ok")]);
    let wf2 = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            agent_node("agent", "Agent", "Echo: {{Input.prompt}}"),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![edge("e1", "in", "agent"), edge("e2", "agent", "out")],
    );
    started(&engine2, wf2, "marco").await.wait().await.unwrap();
    assert_eq!(service2.requests()[0].prompt, "Echo: marco");
}

// ---------------------------------------------------------------------------
// Scenario 2: condition prune
// ---------------------------------------------------------------------------

#[tokio::test]
async fn condition_routes_and_skips_losing_branch() {
    let (engine, _service) = engine_with(vec![claude_echo_turn("from A")]);
    let wf = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            node(
                "cond",
                NodeConfig::Condition(ConditionConfig {
                    name: "Check".into(),
                    combinator: RuleCombinator::And,
                    rules: vec![ConditionRule {
                        input_reference: "{{Input.prompt}}".into(),
                        operator: ConditionOperator::Contains,
                        compare_value: "x".into(),
                    }],
                }),
            ),
            agent_node("a", "A", "win"),
            agent_node("b", "B", "lose"),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![
            edge("e1", "in", "cond"),
            handled_edge("e2", "cond", "a", "true"),
            handled_edge("e3", "cond", "b", "false"),
            edge("e4", "a", "out"),
            edge("e5", "b", "out"),
        ],
    );

    let handle = started(&engine, wf, "xyz").await;
    let execution_id = handle.execution_id.clone();
    let result = handle.wait().await.unwrap();
    assert_eq!(result, json!("from A"));

    let summary = engine
        .execution_store()
        .load_summary(&execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.nodes["a"].status, NodeStatus::Complete);
    assert_eq!(summary.nodes["b"].status, NodeStatus::Skipped);
    assert_eq!(summary.status, ExecutionStatus::Complete);
}

// ---------------------------------------------------------------------------
// Scenario 3: approval reject
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_reject_flows_to_rejected_handle() {
    let (engine, _service) = engine_with(vec![claude_echo_turn("draft")]);
    let wf = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            agent_node("agent", "Agent", "write a draft"),
            node(
                "gate",
                NodeConfig::Approval(ApprovalConfig {
                    name: "Gate".into(),
                    prompt_message: "Ship {{Agent.value}}?".into(),
                    display_data_reference: None,
                    feedback_prompt: None,
                    timeout_ms: None,
                    timeout_action: ApprovalTimeoutAction::Reject,
                }),
            ),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![
            edge("e1", "in", "agent"),
            edge("e2", "agent", "gate"),
            handled_edge("e3", "gate", "out", "rejected"),
        ],
    );

    let handle = started(&engine, wf, "go").await;
    let execution_id = handle.execution_id.clone();

    // Wait for the node-waiting event, then reject.
    let mut rx = engine.subscribe(&execution_id, None).await;
    let approvals = engine.approvals();
    let exec_for_task = execution_id.clone();
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let ExecutionEvent::NodeWaiting { node_id, approval } = record.event {
                assert_eq!(approval.prompt_message, "Ship draft?");
                approvals.submit(
                    &exec_for_task,
                    &node_id,
                    ApprovalResponse {
                        approved: false,
                        feedback: Some("no".into()),
                        responded_at: Utc::now(),
                    },
                );
                break;
            }
        }
    });

    let result = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("approval flow should finish")
        .unwrap();
    // Output hangs off the rejected handle; the approval's value is false.
    assert_eq!(result, json!(false));

    let names = event_names(&engine.bus().journal(&execution_id));
    assert!(names.contains(&"node-waiting:gate".to_string()));
    assert!(names.contains(&"node-complete:gate".to_string()));
}

// ---------------------------------------------------------------------------
// Scenario 4: interrupt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupt_cancels_agents_and_ends_stream() {
    let service = Arc::new(ScriptedService::hanging());
    let engine = Engine::new(
        LatticeConfig::default(),
        Arc::new(FixedServiceFactory::new(
            Arc::clone(&service) as Arc<dyn lattice_core::agent::AgentService>
        )),
        Arc::new(SandboxSet {
            bash: Arc::new(FakeBashSandbox::default()),
            js: Arc::new(FakeJsSandbox),
        }),
        Arc::new(MemoryWorkflowStore::new()),
        Arc::new(MemoryExecutionStore::new()),
    );

    let wf = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            agent_node("agent", "Agent", "sleep forever"),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![edge("e1", "in", "agent"), edge("e2", "agent", "out")],
    );

    let handle = started(&engine, wf, "go").await;
    let execution_id = handle.execution_id.clone();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.interrupt(&execution_id));

    let err = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("interrupt should end the run within a second")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AgentInterrupted);
    assert_eq!(err.message, "Execution interrupted");

    let journal = engine.bus().journal(&execution_id);
    let names = event_names(&journal);
    assert!(names.contains(&"node-error:agent".to_string()));
    assert_eq!(names.last().unwrap(), "execution-error");

    // No further events are accepted after the terminal.
    assert!(engine
        .bus()
        .publish(
            &execution_id,
            ExecutionEvent::NodeStart {
                node_id: "late".into(),
                node_name: "Late".into()
            }
        )
        .is_none());
}

// ---------------------------------------------------------------------------
// Scenario 5: reconnect / full replay of a completed execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_subscriber_replays_completed_execution() {
    let (engine, _service) = engine_with(vec![claude_echo_turn("done")]);
    let wf = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            agent_node("agent", "Agent", "work"),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![edge("e1", "in", "agent"), edge("e2", "agent", "out")],
    );

    let handle = started(&engine, wf, "go").await;
    let execution_id = handle.execution_id.clone();
    handle.wait().await.unwrap();

    let mut rx = engine.subscribe(&execution_id, None).await;
    let mut replayed = Vec::new();
    while let Some(record) = rx.recv().await {
        replayed.push(record);
    }

    let journal = engine.bus().journal(&execution_id);
    assert_eq!(event_names(&replayed), event_names(&journal));
    assert!(matches!(
        replayed.last().unwrap().event,
        ExecutionEvent::ExecutionComplete { .. }
    ));

    // After-timestamp catch-up: everything past the cut, nothing before.
    let cut = journal[2].timestamp;
    let mut rx = engine.subscribe(&execution_id, Some(cut)).await;
    let mut tail = Vec::new();
    while let Some(record) = rx.recv().await {
        tail.push(record);
    }
    assert_eq!(tail.len(), journal.len() - 3);
    assert_eq!(tail[0].timestamp, journal[3].timestamp);
}

// ---------------------------------------------------------------------------
// Scenario 6: evolution auto-apply
// ---------------------------------------------------------------------------

#[tokio::test]
async fn self_reflect_auto_applies_model_update() {
    let evolution = json!({
        "reasoning": "opus handles this workload better",
        "expectedImpact": "quality",
        "riskAssessment": "low",
        "mutations": [{"type": "update-model", "nodeId": "a", "newModel": "opus"}]
    });
    // Turn 1: agent A; turn 2: the reflection agent proposing the evolution.
    let (engine, _service) = engine_with(vec![
        claude_echo_turn("analysis"),
        vec![json!({"type": "result", "subtype": "success",
                    "result": evolution.to_string(), "structured_output": evolution})],
    ]);

    let wf = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            agent_node("a", "A", "analyse"),
            node(
                "reflect",
                NodeConfig::SelfReflect(SelfReflectConfig {
                    name: "Reflect".into(),
                    agent: AgentFlavor::Claude,
                    model: None,
                    mode: ReflectMode::AutoApply,
                    reflection_goal: "pick better models".into(),
                    scope: vec![EvolutionScope::Models],
                    max_mutations: Some(2),
                    include_transcripts: false,
                    timeout_ms: None,
                }),
            ),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![
            edge("e1", "in", "a"),
            edge("e2", "a", "reflect"),
            edge("e3", "reflect", "out"),
        ],
    );

    // The workflow must exist in the store for the applier to persist it.
    engine.workflow_store().save(&wf).await.unwrap();

    let handle = started(&engine, wf, "go").await;
    let execution_id = handle.execution_id.clone();
    handle.wait().await.unwrap();

    // node-evolution event with applied=true.
    let journal = engine.bus().journal(&execution_id);
    let evolution_event = journal
        .iter()
        .find_map(|r| match &r.event {
            ExecutionEvent::NodeEvolution {
                applied,
                validation_errors,
                ..
            } => Some((*applied, validation_errors.clone())),
            _ => None,
        })
        .expect("node-evolution event");
    assert!(evolution_event.0, "evolution should be applied");
    assert!(evolution_event.1.is_empty());

    // The stored workflow carries the new model and a history record.
    let stored = engine.workflow_store().load("wf").await.unwrap().unwrap();
    match &stored.node("a").unwrap().data {
        NodeConfig::ClaudeAgent(c) => assert_eq!(c.model.as_deref(), Some("opus")),
        other => panic!("unexpected config {other:?}"),
    }
    let history = stored.evolution_history.as_ref().unwrap();
    assert_eq!(history.len(), 1);
    assert_ne!(history[0].before_digest, history[0].after_digest);
}

// ---------------------------------------------------------------------------
// Merge strategies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_all_merge_collects_both_branches() {
    let (engine, _service) = engine_with(vec![
        claude_echo_turn("left"),
        claude_echo_turn("right"),
    ]);
    let wf = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            agent_node("l", "Left", "left"),
            agent_node("r", "Right", "right"),
            node(
                "join",
                NodeConfig::Merge(lattice_core::workflow::MergeConfig {
                    name: "Join".into(),
                    strategy: lattice_core::workflow::MergeStrategy::WaitAll,
                }),
            ),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![
            edge("e1", "in", "l"),
            edge("e2", "in", "r"),
            edge("e3", "l", "join"),
            edge("e4", "r", "join"),
            edge("e5", "join", "out"),
        ],
    );

    let handle = started(&engine, wf, "go").await;
    let result = handle.wait().await.unwrap();
    // Both branch outputs land in the merged map (scripted turns are served
    // in order, so either branch may get either text).
    let object = result.as_object().expect("merged map");
    assert_eq!(object.len(), 2);
    let mut texts: Vec<&str> = object.values().filter_map(Value::as_str).collect();
    texts.sort();
    assert_eq!(texts, vec!["left", "right"]);
}

#[tokio::test]
async fn validation_failure_emits_event_and_never_runs() {
    let (engine, service) = engine_with(vec![]);
    // Two inputs: invalid.
    let wf = workflow(
        vec![
            node("in", NodeConfig::Input(InputConfig { name: "Input".into() })),
            node("in2", NodeConfig::Input(InputConfig { name: "Input 2".into() })),
            node("out", NodeConfig::Output(OutputNodeConfig { name: "Output".into() })),
        ],
        vec![edge("e1", "in", "out"), edge("e2", "in2", "out")],
    );

    match engine.start(wf, "x".into()).await {
        StartOutcome::Invalid(report) => {
            assert!(!report.valid);
        }
        StartOutcome::Started(_) => panic!("run should not have started"),
    }
    assert_eq!(service.turns_started(), 0);
}
