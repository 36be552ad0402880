//! Agent service implementations: the process-backed CLI bridge and the
//! scripted fake used throughout the test suites.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{AbortHandle, AgentService, Dialect, ServiceRequest, ServiceStream};
use crate::{LatticeError, Result};

/// Resolve binary by checking configured path, then `$PATH` candidates.
///
/// If a configured path is provided but doesn't exist, returns `None`
/// without falling back to PATH discovery (explicit config takes precedence).
pub fn resolve_binary(configured: Option<&str>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(path) = configured {
        let p = PathBuf::from(path);
        return if p.exists() { Some(p) } else { None };
    }
    for name in candidates {
        if let Ok(p) = which::which(name) {
            return Some(p);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// CLI-backed service
// ---------------------------------------------------------------------------

/// Shells out to the `claude` / `codex` CLI and streams its JSONL output.
///
/// One process per turn; the abort handle kills the child.
pub struct CliAgentService {
    dialect: Dialect,
    configured_path: Option<String>,
}

impl CliAgentService {
    pub fn new(dialect: Dialect, configured_path: Option<String>) -> Self {
        Self {
            dialect,
            configured_path,
        }
    }

    fn build_args(&self, request: &ServiceRequest) -> Vec<String> {
        match self.dialect {
            Dialect::Claude => {
                let mut args = vec![
                    "-p".to_string(),
                    request.prompt.clone(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--verbose".to_string(),
                ];
                if let Some(model) = &request.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                if let Some(system) = &request.system_prompt {
                    args.push("--append-system-prompt".to_string());
                    args.push(system.clone());
                }
                if let Some(session) = &request.resume_session {
                    args.push("--resume".to_string());
                    args.push(session.clone());
                }
                args
            }
            Dialect::Codex => {
                let mut args = vec![
                    "exec".to_string(),
                    "--json".to_string(),
                    request.prompt.clone(),
                ];
                if let Some(model) = &request.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                if let Some(session) = &request.resume_session {
                    args.push("--resume-thread".to_string());
                    args.push(session.clone());
                }
                args
            }
        }
    }
}

#[async_trait]
impl AgentService for CliAgentService {
    async fn start(&self, request: ServiceRequest) -> Result<ServiceStream> {
        let candidates = match self.dialect {
            Dialect::Claude => ["claude"],
            Dialect::Codex => ["codex"],
        };
        let binary = resolve_binary(self.configured_path.as_deref(), &candidates)
            .ok_or_else(|| super::service_unavailable(candidates[0]))?;

        let mut command = Command::new(&binary);
        command
            .args(self.build_args(&request))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null());
        if let Some(cwd) = &request.working_directory {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| LatticeError::Agent(format!("failed to spawn {}: {e}", binary.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LatticeError::Agent("agent stdout not piped".into()))?;

        let (tx, rx) = mpsc::channel::<Value>(64);
        let (abort, mut aborted) = AbortHandle::new();

        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            loop {
                tokio::select! {
                    biased;

                    _ = aborted.changed() => {
                        if *aborted.borrow() {
                            debug!("abort signalled, killing agent process");
                            let _ = child.start_kill();
                            break;
                        }
                    }

                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<Value>(trimmed) {
                                    Ok(value) => {
                                        if tx.send(value).await.is_err() {
                                            let _ = child.start_kill();
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!(%e, "dropping unparseable agent output line");
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(%e, "agent stdout read failed");
                                break;
                            }
                        }
                    }
                }
            }
            let _ = child.wait().await;
        });

        Ok(ServiceStream { events: rx, abort })
    }
}

// ---------------------------------------------------------------------------
// Scripted service (tests)
// ---------------------------------------------------------------------------

/// Replays pre-baked native event turns; records every request it sees.
pub struct ScriptedService {
    turns: Mutex<VecDeque<Vec<Value>>>,
    requests: Mutex<Vec<ServiceRequest>>,
    started: AtomicUsize,
    hang: bool,
}

impl ScriptedService {
    pub fn new(turns: Vec<Vec<Value>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            hang: false,
        }
    }

    /// A service whose stream never produces events and never closes until
    /// aborted.
    pub fn hanging() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            hang: true,
        }
    }

    pub fn turns_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// The `resume_session` of every request, in order.
    pub fn resume_sessions(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.resume_session.clone())
            .collect()
    }

    /// Full request log.
    pub fn requests(&self) -> Vec<ServiceRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentService for ScriptedService {
    async fn start(&self, request: ServiceRequest) -> Result<ServiceStream> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let (tx, rx) = mpsc::channel::<Value>(64);
        let (abort, mut aborted) = AbortHandle::new();

        if self.hang {
            tokio::spawn(async move {
                loop {
                    if aborted.changed().await.is_err() {
                        break;
                    }
                    if *aborted.borrow() {
                        break;
                    }
                }
                drop(tx);
            });
            return Ok(ServiceStream { events: rx, abort });
        }

        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        tokio::spawn(async move {
            for event in turn {
                if *aborted.borrow() {
                    break;
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(ServiceStream { events: rx, abort })
    }
}
