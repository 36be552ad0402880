//! Persisted state: workflow documents, execution summaries, event journals.
//!
//! Storage is a collaborator behind traits so the engine and tests can run
//! against in-memory stores. The file-backed implementations keep one JSON
//! document per workflow and, per execution, a summary document plus an
//! append-only `events.jsonl` journal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::event::ExecutionEventRecord;
use crate::workflow::{NodeStatus, Workflow};
use crate::{LatticeError, Result};

// ---------------------------------------------------------------------------
// Execution summaries
// ---------------------------------------------------------------------------

/// Overall status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Complete,
    Error,
}

/// Per-node outcome kept in the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Durable record of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<Value>,
    pub nodes: HashMap<String, NodeSummary>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Workflow>>;
    async fn save(&self, workflow: &Workflow) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Workflow>>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_summary(&self, summary: &ExecutionSummary) -> Result<()>;
    async fn load_summary(&self, execution_id: &str) -> Result<Option<ExecutionSummary>>;
    async fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<ExecutionSummary>>;
    /// Append records to the execution's journal. Entries are immutable once
    /// written.
    async fn append_events(&self, execution_id: &str, events: &[ExecutionEventRecord])
        -> Result<()>;
    async fn load_events(&self, execution_id: &str) -> Result<Vec<ExecutionEventRecord>>;
}

// ---------------------------------------------------------------------------
// File-backed stores
// ---------------------------------------------------------------------------

/// `<root>/workflows/<id>.json`
pub struct FsWorkflowStore {
    root: PathBuf,
}

impl FsWorkflowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir().join(format!("{id}.json"))
    }
}

#[async_trait]
impl WorkflowStore for FsWorkflowStore {
    async fn load(&self, id: &str) -> Result<Option<Workflow>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let workflow = serde_json::from_str(&contents)
            .map_err(|e| LatticeError::Storage(format!("corrupt workflow {}: {e}", path.display())))?;
        Ok(Some(workflow))
    }

    async fn save(&self, workflow: &Workflow) -> Result<()> {
        std::fs::create_dir_all(self.dir())?;
        let contents = serde_json::to_string_pretty(workflow)?;
        // Write-then-rename so readers never observe a half-written document.
        let tmp = self.path(&workflow.id).with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, self.path(&workflow.id))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Workflow>> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Workflow>(&contents) {
                Ok(wf) => out.push(wf),
                Err(e) => {
                    tracing::warn!(path = %path.display(), %e, "skipping unreadable workflow");
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

/// `<root>/executions/<id>/{summary.json,events.jsonl}`
pub struct FsExecutionStore {
    root: PathBuf,
}

impl FsExecutionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, execution_id: &str) -> PathBuf {
        self.root.join("executions").join(execution_id)
    }

    fn read_events(path: &Path) -> Result<Vec<ExecutionEventRecord>> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ExecutionEventRecord = serde_json::from_str(&line)?;
            events.push(record);
        }
        Ok(events)
    }
}

#[async_trait]
impl ExecutionStore for FsExecutionStore {
    async fn save_summary(&self, summary: &ExecutionSummary) -> Result<()> {
        let dir = self.dir(&summary.execution_id);
        std::fs::create_dir_all(&dir)?;
        let contents = serde_json::to_string_pretty(summary)?;
        let tmp = dir.join("summary.json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, dir.join("summary.json"))?;
        Ok(())
    }

    async fn load_summary(&self, execution_id: &str) -> Result<Option<ExecutionSummary>> {
        let path = self.dir(execution_id).join("summary.json");
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<ExecutionSummary>> {
        let dir = self.root.join("executions");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path().join("summary.json");
            if !path.exists() {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<ExecutionSummary>(&contents) {
                Ok(s) if s.workflow_id == workflow_id => out.push(s),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), %e, "skipping unreadable summary");
                }
            }
        }
        out.sort_by_key(|s| s.started_at);
        Ok(out)
    }

    async fn append_events(
        &self,
        execution_id: &str,
        events: &[ExecutionEventRecord],
    ) -> Result<()> {
        let dir = self.dir(execution_id);
        std::fs::create_dir_all(&dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))?;
        for record in events {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        Ok(())
    }

    async fn load_events(&self, execution_id: &str) -> Result<Vec<ExecutionEventRecord>> {
        let path = self.dir(execution_id).join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        Self::read_events(&path)
    }
}

// ---------------------------------------------------------------------------
// In-memory stores (tests, embedding)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: Mutex<HashMap<String, Workflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn load(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.workflows.lock().unwrap().get(id).cloned())
    }

    async fn save(&self, workflow: &Workflow) -> Result<()> {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.workflows.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Workflow>> {
        let mut out: Vec<_> = self.workflows.lock().unwrap().values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryExecutionStore {
    summaries: Mutex<HashMap<String, ExecutionSummary>>,
    journals: Mutex<HashMap<String, Vec<ExecutionEventRecord>>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn save_summary(&self, summary: &ExecutionSummary) -> Result<()> {
        self.summaries
            .lock()
            .unwrap()
            .insert(summary.execution_id.clone(), summary.clone());
        Ok(())
    }

    async fn load_summary(&self, execution_id: &str) -> Result<Option<ExecutionSummary>> {
        Ok(self.summaries.lock().unwrap().get(execution_id).cloned())
    }

    async fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<ExecutionSummary>> {
        let mut out: Vec<_> = self
            .summaries
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.started_at);
        Ok(out)
    }

    async fn append_events(
        &self,
        execution_id: &str,
        events: &[ExecutionEventRecord],
    ) -> Result<()> {
        self.journals
            .lock()
            .unwrap()
            .entry(execution_id.to_string())
            .or_default()
            .extend(events.iter().cloned());
        Ok(())
    }

    async fn load_events(&self, execution_id: &str) -> Result<Vec<ExecutionEventRecord>> {
        Ok(self
            .journals
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}
