//! Lifecycle controller for a locally spawned Jupyter server.
//!
//! [`JupyterEnvironment`] owns one notebook/lab server process at a time:
//! it spawns the interpreter, watches its output for the readiness banner,
//! extracts port and token, enforces a startup timeout, and classifies the
//! eventual exit. Host applications observe transitions through a
//! per-instance subscription API instead of polling.

mod config;
mod environment;
mod error;
mod events;
mod mode;
mod scanner;

pub use config::DEFAULT_STARTUP_TIMEOUT_MS;
pub use config::EnvironmentConfig;
pub use config::PythonExecutable;
pub use environment::EnvironmentStatus;
pub use environment::JupyterEnvironment;
pub use error::EnvironmentError;
pub use events::EnvironmentEvent;
pub use events::EnvironmentEventKind;
pub use events::SubscriptionId;
pub use mode::ServerMode;
