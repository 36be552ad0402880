//! Agent adapter: a uniform streaming interface over external agent services.
//!
//! The engine never talks to an agent service directly. An [`AgentService`]
//! collaborator produces service-native JSON events; the adapter translates
//! them into the [`AgentEvent`] vocabulary, owns per-instance session state,
//! captures structured output, and exposes an idempotent interrupt.

pub mod claude;
pub mod codex;
mod schema;
pub mod service;

pub use schema::strictify_schema;
pub use service::{CliAgentService, ScriptedService};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use crate::event::{AgentEvent, StructuredOutput};
use crate::{LatticeError, Result};

/// Which native event vocabulary the wrapped service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Claude,
    Codex,
}

/// Request handed to the underlying service for one turn.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub working_directory: Option<String>,
    /// Session/thread identifier to resume, when continuing a conversation.
    pub resume_session: Option<String>,
    /// Prepared (dialect-specific) output schema, when structured output was
    /// requested.
    pub output_schema: Option<Value>,
    pub mcp_servers: Vec<String>,
}

/// Signals the service to stop the in-flight turn. Cloneable and idempotent.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn abort(&self) {
        // Receivers may be gone already; aborting twice is a no-op.
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One in-flight turn: a stream of service-native JSON events plus the
/// handle that stops it.
pub struct ServiceStream {
    pub events: mpsc::Receiver<Value>,
    pub abort: AbortHandle,
}

/// External agent collaborator contract. Implementations shell out to a CLI,
/// call a network API, or replay scripted fixtures in tests.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn start(&self, request: ServiceRequest) -> Result<ServiceStream>;
}

/// Per-turn configuration the executor hands the adapter.
#[derive(Debug, Clone, Default)]
pub struct AgentInput {
    pub prompt: String,
    /// Overrides the adapter's stored session when present.
    pub session_id: Option<String>,
    pub working_directory: Option<String>,
    pub output_config: Option<OutputConfig>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub mcp_servers: Vec<String>,
}

/// Structured-output request: a JSON schema (as text) and where to land it.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub schema: String,
    pub file_path: Option<String>,
}

/// Behaviour hooks a dialect translator must provide.
///
/// `translate` is called once per native event; `finish` once when the
/// native stream ends, and may emit the terminal event if the service died
/// without one.
pub trait EventTranslator: Send {
    fn translate(&mut self, native: &Value) -> Vec<AgentEvent>;
    fn finish(&mut self) -> Vec<AgentEvent>;
    /// Session/thread id captured from the first session-init-shaped event.
    fn session_id(&self) -> Option<&str>;
    /// Structured output captured from the terminal, if any.
    fn structured_output(&self) -> Option<&StructuredOutput>;
    /// Whether a terminal event has been produced.
    fn finished(&self) -> bool;
}

#[derive(Default)]
struct AdapterState {
    session_id: Option<String>,
    structured_output: Option<StructuredOutput>,
    active_abort: Option<AbortHandle>,
    interrupted: bool,
}

/// Wraps one agent service instance behind the engine's uniform interface.
pub struct AgentAdapter {
    dialect: Dialect,
    service: Arc<dyn AgentService>,
    state: Arc<Mutex<AdapterState>>,
}

impl AgentAdapter {
    pub fn new(dialect: Dialect, service: Arc<dyn AgentService>) -> Self {
        Self {
            dialect,
            service,
            state: Arc::new(Mutex::new(AdapterState::default())),
        }
    }

    pub fn claude(service: Arc<dyn AgentService>) -> Self {
        Self::new(Dialect::Claude, service)
    }

    pub fn codex(service: Arc<dyn AgentService>) -> Self {
        Self::new(Dialect::Codex, service)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The session captured from the most recent turn.
    pub async fn session_id(&self) -> Option<String> {
        self.state.lock().await.session_id.clone()
    }

    /// Structured output captured from the most recent turn.
    pub async fn structured_output(&self) -> Option<StructuredOutput> {
        self.state.lock().await.structured_output.clone()
    }

    /// Stop the in-flight turn, if any. Idempotent; safe to race `execute`.
    pub async fn interrupt(&self) {
        let mut state = self.state.lock().await;
        state.interrupted = true;
        if let Some(abort) = &state.active_abort {
            debug!("interrupting active agent stream");
            abort.abort();
        }
    }

    /// Run one turn. The returned receiver yields translated events ending
    /// in exactly one terminal (`complete` or `error`); errors never escape
    /// as `Err` once the stream has started.
    pub async fn execute(&self, input: AgentInput) -> Result<mpsc::Receiver<AgentEvent>> {
        let (tx, rx) = mpsc::channel::<AgentEvent>(64);

        // Prepare the output schema up front; a malformed schema fails the
        // turn before the service is contacted.
        let output_schema = match &input.output_config {
            Some(cfg) => match serde_json::from_str::<Value>(&cfg.schema) {
                Ok(mut parsed) => {
                    if self.dialect == Dialect::Codex {
                        strictify_schema(&mut parsed);
                    }
                    Some(parsed)
                }
                Err(e) => {
                    let _ = tx
                        .send(AgentEvent::Error {
                            message: format!("invalid output schema JSON: {e}"),
                        })
                        .await;
                    return Ok(rx);
                }
            },
            None => None,
        };

        let resume_session = {
            let mut state = self.state.lock().await;
            state.interrupted = false;
            state.structured_output = None;
            match &input.session_id {
                // An explicit session overrides and replaces the stored one.
                Some(explicit) => {
                    state.session_id = Some(explicit.clone());
                    Some(explicit.clone())
                }
                None => state.session_id.clone(),
            }
        };

        let request = ServiceRequest {
            prompt: input.prompt.clone(),
            model: input.model.clone(),
            system_prompt: input.system_prompt.clone(),
            working_directory: input.working_directory.clone(),
            resume_session,
            output_schema,
            mcp_servers: input.mcp_servers.clone(),
        };

        let stream = match self.service.start(request).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return Ok(rx);
            }
        };

        {
            let mut state = self.state.lock().await;
            if state.interrupted {
                // Interrupted between lock drops: stop the stream we just
                // opened and report the interruption.
                stream.abort.abort();
                let _ = tx
                    .send(AgentEvent::Error {
                        message: "Execution interrupted".to_string(),
                    })
                    .await;
                return Ok(rx);
            }
            state.active_abort = Some(stream.abort.clone());
        }

        let mut translator: Box<dyn EventTranslator> = match self.dialect {
            Dialect::Claude => Box::new(claude::ClaudeTranslator::new(
                input.output_config.clone(),
            )),
            Dialect::Codex => Box::new(codex::CodexTranslator::new(input.output_config.clone())),
        };

        let state = Arc::clone(&self.state);
        let mut events = stream.events;
        tokio::spawn(async move {
            while let Some(native) = events.recv().await {
                for event in translator.translate(&native) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                if translator.finished() {
                    break;
                }
            }

            let had_terminal = translator.finished();
            let mut tail = translator.finish();

            let mut state = state.lock().await;
            if let Some(session) = translator.session_id() {
                state.session_id = Some(session.to_string());
            }
            if let Some(structured) = translator.structured_output() {
                state.structured_output = Some(structured.clone());
            }
            state.active_abort = None;

            // Stream died without a terminal: interruption wins over any
            // other explanation.
            if !had_terminal && state.interrupted {
                tail = vec![AgentEvent::Error {
                    message: "Execution interrupted".to_string(),
                }];
            }
            drop(state);

            for event in tail {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

/// Build an adapter error for services that cannot start.
pub(crate) fn service_unavailable(what: &str) -> LatticeError {
    LatticeError::Agent(format!("{what} is not available"))
}
