use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{LatticeError, Result};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeConfig {
    pub general: GeneralConfig,
    pub agents: AgentsConfig,
    pub sandbox: SandboxConfig,
    pub storage: StorageConfig,
}

impl LatticeConfig {
    /// Load config from a specific `lattice.toml` file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LatticeError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| LatticeError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `./lattice.toml` if it exists, otherwise return defaults.
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("lattice.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%e, "failed to load lattice.toml, falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// Validate the config and return actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.general.default_node_timeout_ms == 0 {
            return Err(LatticeError::Config(
                "general.default_node_timeout_ms must be > 0".into(),
            ));
        }
        if self.general.max_ticks_per_node == 0 {
            return Err(LatticeError::Config(
                "general.max_ticks_per_node must be > 0".into(),
            ));
        }
        if self.general.event_channel_capacity == 0 {
            return Err(LatticeError::Config(
                "general.event_channel_capacity must be > 0".into(),
            ));
        }
        if self.general.subscriber_queue_capacity == 0 {
            return Err(LatticeError::Config(
                "general.subscriber_queue_capacity must be > 0".into(),
            ));
        }
        if self.sandbox.default_script_timeout_ms == 0 {
            return Err(LatticeError::Config(
                "sandbox.default_script_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GeneralConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default per-node wall-clock bound when a node sets none, in ms.
    pub default_node_timeout_ms: u64,
    /// Fail the run with CYCLE_DETECTED when one node is enqueued this many
    /// times in a single execution.
    pub max_ticks_per_node: u32,
    /// Bound on the executor -> coordinator event channel.
    pub event_channel_capacity: usize,
    /// Bound on each bus subscriber's queue; overflowing subscribers are
    /// dropped as desynchronized.
    pub subscriber_queue_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_ms: 600_000,
            max_ticks_per_node: 1_000,
            event_channel_capacity: 256,
            subscriber_queue_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Explicit path to the claude binary; `$PATH` discovery otherwise.
    pub claude_path: Option<String>,
    /// Explicit path to the codex binary; `$PATH` discovery otherwise.
    pub codex_path: Option<String>,
    /// Model passed to agents that configure none.
    pub default_model: Option<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            claude_path: None,
            codex_path: None,
            default_model: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Explicit path to the node binary used by the javascript sandbox.
    pub node_path: Option<String>,
    /// Default timeout for javascript/bash nodes that set none, in ms.
    pub default_script_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            node_path: None,
            default_script_timeout_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// StorageConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for workflow documents and execution journals.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".lattice"),
        }
    }
}
