use thiserror::Error;

/// Why a run ended abnormally.
///
/// Carried by [`EnvironmentEvent::Error`] notifications; controller methods
/// never return these directly.
///
/// [`EnvironmentEvent::Error`]: crate::events::EnvironmentEvent::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    /// The spawn call itself failed; no server process ever existed.
    #[error("unable to start the server process")]
    UnableToStart,
    /// The server process terminated with a non-zero exit code.
    #[error("the server process crashed with a non-zero exit code")]
    CrashedWithError,
    /// The watchdog forced termination before the server became ready.
    #[error("the server did not become ready before the startup timeout")]
    StartupTimeout,
    /// The server terminated cleanly while still starting, without ever
    /// announcing its connection URL.
    #[error("the server process exited before becoming ready")]
    ExitedWithoutReachingReady,
}
