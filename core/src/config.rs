use std::ffi::OsStr;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::mode::ServerMode;

/// Default time allowed in the starting phase before the watchdog aborts
/// the run. Zero disables the watchdog.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

/// How the Python interpreter that hosts the server is located.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PythonExecutable {
    /// Resolve `python` through the environment.
    #[default]
    Python,
    /// Launch a specific interpreter binary.
    Path(PathBuf),
}

impl PythonExecutable {
    /// Program name handed to the spawn call.
    pub fn program(&self) -> &OsStr {
        match self {
            PythonExecutable::Python => OsStr::new("python"),
            PythonExecutable::Path(path) => path.as_os_str(),
        }
    }
}

/// Launch settings consulted at each start of a run.
///
/// The host owns persistence; the controller keeps a copy that its setters
/// update immediately and that is read once per `start()`, so edits never
/// perturb a run already in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EnvironmentConfig {
    /// Interpreter that launches the server.
    pub executable: PythonExecutable,
    /// Requested server variant for the next run.
    pub mode: ServerMode,
    /// Startup watchdog delay in milliseconds; 0 disables.
    pub startup_timeout_ms: u64,
    /// Echo every server output chunk to the host log.
    pub debug_echo: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            executable: PythonExecutable::default(),
            mode: ServerMode::default(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            debug_echo: false,
        }
    }
}
