pub mod agent;
pub mod approval;
pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod evolution;
pub mod executor;
pub mod protocol;
pub mod reference;
pub mod replay;
pub mod sandbox;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod validator;
pub mod workflow;

pub use error::{ErrorCode, ExecutionError, LatticeError, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("lattice tracing initialised");
}
