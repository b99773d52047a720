use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::config::EnvironmentConfig;
use crate::config::PythonExecutable;
use crate::error::EnvironmentError;
use crate::events::EnvironmentEvent;
use crate::events::EnvironmentEventKind;
use crate::events::ListenerRegistry;
use crate::events::SubscriptionId;
use crate::mode::ServerMode;
use crate::scanner::ReadinessScanner;

const READ_CHUNK_BYTES: usize = 8192;
// Quiet period granted to the pipe readers after the child exits, so output
// flushed on the way out still lands in the log before classification.
const OUTPUT_DRAIN_QUIET: Duration = Duration::from_millis(250);

/// Lifecycle phase of the managed server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvironmentStatus {
    /// No process; the only state `start()` accepts.
    #[default]
    Exited,
    /// Spawned, waiting for the readiness banner.
    Starting,
    /// Readiness banner parsed; port and token are known.
    Running,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentStatus::Exited => write!(f, "exited"),
            EnvironmentStatus::Starting => write!(f, "starting"),
            EnvironmentStatus::Running => write!(f, "running"),
        }
    }
}

/// Controller for one locally spawned Jupyter server.
///
/// The controller owns the child process slot exclusively: callers drive it
/// through [`start`](Self::start) and [`exit`](Self::exit), read state
/// through accessors, and observe transitions through the subscription API.
/// One instance is created per served root directory and lives for the
/// host's lifetime; runs cycle through it.
///
/// Cloning is cheap and yields another handle to the same environment.
/// Background tasks (output readers, the run supervisor, the notification
/// dispatcher) are spawned on the ambient tokio runtime, so the controller
/// must be created and driven inside one.
#[derive(Clone)]
pub struct JupyterEnvironment {
    inner: Arc<EnvironmentInner>,
}

impl JupyterEnvironment {
    /// Creates a controller for a server rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, config: EnvironmentConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EnvironmentInner {
            root: root.into(),
            config: Mutex::new(config),
            run: Mutex::new(RunState::default()),
            listeners: ListenerRegistry::default(),
            event_tx,
            dispatch_task: OnceLock::new(),
        });
        let task = tokio::spawn(dispatch_events(Arc::downgrade(&inner), event_rx));
        let _ = inner.dispatch_task.set(task);
        Self { inner }
    }

    /// Spawns the server process and begins watching for readiness.
    ///
    /// Legal only while [`EnvironmentStatus::Exited`]; any other status makes
    /// this a no-op. Returns as soon as the spawn request was issued; follow
    /// the `Ready` notification (or poll [`status`](Self::status)) to learn
    /// when the server is reachable. A failed spawn surfaces as an
    /// `Error(UnableToStart)` notification and the status stays `Exited`.
    pub fn start(&self) {
        let config = match self.inner.config.lock() {
            Ok(config) => config.clone(),
            Err(_) => return,
        };
        let Ok(mut run) = self.inner.run.lock() else {
            return;
        };
        if run.status != EnvironmentStatus::Exited {
            warn!(status = %run.status, "ignoring start request while a run is active");
            return;
        }
        run.log.clear();
        run.timed_out = false;

        let mut command = Command::new(config.executable.program());
        command
            .arg("-m")
            .arg(config.mode.launch_module())
            .current_dir(&self.inner.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, mode = %config.mode, "failed to spawn the server process");
                self.inner
                    .queue_event(EnvironmentEvent::Error(EnvironmentError::UnableToStart));
                return;
            }
        };

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, output_tx));
        }
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        run.status = EnvironmentStatus::Starting;
        run.mode = Some(config.mode);
        run.control = Some(control_tx);
        self.inner.queue_event(EnvironmentEvent::Starting);
        self.inner.queue_event(EnvironmentEvent::Change);
        drop(run);

        debug!(mode = %config.mode, root = %self.inner.root.display(), "server process spawned");
        let supervisor = Supervisor {
            inner: Arc::clone(&self.inner),
            scanner: ReadinessScanner::new(config.mode),
            debug_echo: config.debug_echo,
        };
        tokio::spawn(supervisor.run(child, output_rx, control_rx, config.startup_timeout_ms));
    }

    /// Requests a graceful shutdown of the server process.
    ///
    /// No-op while `Exited`. The status does not change here; it flips to
    /// `Exited` once the child's termination is observed, which is also when
    /// the `Exit` notification fires.
    pub fn exit(&self) {
        let Ok(run) = self.inner.run.lock() else {
            return;
        };
        if run.status == EnvironmentStatus::Exited {
            return;
        }
        if let Some(control) = &run.control {
            let _ = control.send(ControlMessage::Terminate);
        }
    }

    /// Registers `listener` for every event of `kind`.
    pub fn subscribe<F>(&self, kind: EnvironmentEventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&JupyterEnvironment, &EnvironmentEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(kind, Arc::new(listener), false)
    }

    /// Registers `listener` for the next event of `kind` only.
    pub fn subscribe_once<F>(&self, kind: EnvironmentEventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&JupyterEnvironment, &EnvironmentEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(kind, Arc::new(listener), true)
    }

    /// Removes a listener. Returns whether it was still registered.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner.listeners.unsubscribe(subscription)
    }

    pub fn status(&self) -> EnvironmentStatus {
        self.read_run(EnvironmentStatus::Exited, |run| run.status)
    }

    /// Whether a process is currently live (starting or running).
    pub fn is_alive(&self) -> bool {
        self.status() != EnvironmentStatus::Exited
    }

    /// Whether the server reached readiness.
    pub fn is_running(&self) -> bool {
        self.status() == EnvironmentStatus::Running
    }

    /// Port parsed from the readiness banner; `None` unless `Running`.
    pub fn port(&self) -> Option<u16> {
        self.read_run(None, |run| run.port)
    }

    /// Access token parsed from the readiness banner; `None` unless
    /// `Running`.
    pub fn token(&self) -> Option<String> {
        self.read_run(None, |run| run.token.clone())
    }

    /// Server variant of the run in progress; `None` while `Exited`.
    pub fn running_mode(&self) -> Option<ServerMode> {
        self.read_run(None, |run| run.mode)
    }

    /// Every output chunk the current (or most recent) run has emitted.
    pub fn log(&self) -> Vec<String> {
        self.read_run(Vec::new(), |run| run.log.clone())
    }

    /// The most recent output chunk, or an empty string if there is none.
    pub fn last_log_entry(&self) -> String {
        self.read_run(String::new(), |run| {
            run.log.last().cloned().unwrap_or_default()
        })
    }

    /// Root URL of the running server, token included.
    pub fn server_url(&self) -> Option<String> {
        self.read_run(None, |run| {
            let (port, token) = run.connection()?;
            Some(format!("http://localhost:{port}/?token={token}"))
        })
    }

    /// URL opening `relative_path` in the running server's UI.
    ///
    /// The path segment between host and file depends on the mode of the
    /// current run. `None` unless `Running`.
    pub fn file_url(&self, relative_path: &str) -> Option<String> {
        self.read_run(None, |run| {
            let (port, token) = run.connection()?;
            let prefix = run.mode?.file_url_prefix();
            Some(format!(
                "http://localhost:{port}/{prefix}/{relative_path}?token={token}"
            ))
        })
    }

    /// Directory the server exposes.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Snapshot of the launch settings the next run will use.
    pub fn config(&self) -> EnvironmentConfig {
        match self.inner.config.lock() {
            Ok(config) => config.clone(),
            Err(_) => EnvironmentConfig::default(),
        }
    }

    /// Interpreter used for future runs; the current run keeps its own.
    pub fn set_executable(&self, executable: PythonExecutable) {
        if let Ok(mut config) = self.inner.config.lock() {
            config.executable = executable;
        }
    }

    /// Server variant requested for future runs; decoupled from
    /// [`running_mode`](Self::running_mode), which tracks the run in
    /// progress.
    pub fn set_mode(&self, mode: ServerMode) {
        if let Ok(mut config) = self.inner.config.lock() {
            config.mode = mode;
        }
    }

    /// Echo future runs' output chunks to the host log.
    pub fn set_debug_echo(&self, enabled: bool) {
        if let Ok(mut config) = self.inner.config.lock() {
            config.debug_echo = enabled;
        }
    }

    /// Startup watchdog delay for future runs; 0 disables.
    ///
    /// If a run is currently starting, its armed watchdog is replaced with
    /// the new delay (measured from that run's spawn), never doubled up.
    pub fn set_startup_timeout_ms(&self, timeout_ms: u64) {
        if let Ok(mut config) = self.inner.config.lock() {
            config.startup_timeout_ms = timeout_ms;
        }
        if let Ok(run) = self.inner.run.lock()
            && run.status == EnvironmentStatus::Starting
            && let Some(control) = &run.control
        {
            let _ = control.send(ControlMessage::TimeoutChanged(timeout_ms));
        }
    }

    fn read_run<T>(&self, fallback: T, read: impl FnOnce(&RunState) -> T) -> T {
        match self.inner.run.lock() {
            Ok(run) => read(&run),
            Err(_) => fallback,
        }
    }
}

struct EnvironmentInner {
    root: PathBuf,
    config: Mutex<EnvironmentConfig>,
    run: Mutex<RunState>,
    listeners: ListenerRegistry,
    event_tx: mpsc::UnboundedSender<EnvironmentEvent>,
    dispatch_task: OnceLock<JoinHandle<()>>,
}

impl EnvironmentInner {
    /// Queues an event for the dispatch task. Callers hold the run lock, so
    /// queue order equals transition order.
    fn queue_event(&self, event: EnvironmentEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for EnvironmentInner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch_task.get() {
            task.abort();
        }
    }
}

/// State of the current run, reset on every transition to `Exited`.
#[derive(Default)]
struct RunState {
    status: EnvironmentStatus,
    mode: Option<ServerMode>,
    port: Option<u16>,
    token: Option<String>,
    log: Vec<String>,
    timed_out: bool,
    control: Option<mpsc::UnboundedSender<ControlMessage>>,
}

impl RunState {
    fn connection(&self) -> Option<(u16, &str)> {
        if self.status != EnvironmentStatus::Running {
            return None;
        }
        Some((self.port?, self.token.as_deref()?))
    }
}

enum ControlMessage {
    Terminate,
    TimeoutChanged(u64),
}

/// Owns the child for one run: applies output, watchdog, and control events
/// to the shared state, strictly one at a time, until the exit is observed.
struct Supervisor {
    inner: Arc<EnvironmentInner>,
    scanner: ReadinessScanner,
    debug_echo: bool,
}

impl Supervisor {
    async fn run(
        mut self,
        mut child: Child,
        mut output_rx: mpsc::UnboundedReceiver<String>,
        mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
        startup_timeout_ms: u64,
    ) {
        let started_at = Instant::now();
        let mut deadline = startup_deadline(started_at, startup_timeout_ms);
        let mut watchdog_armed = deadline.is_some();

        let exit_result = loop {
            tokio::select! {
                biased;
                Some(chunk) = output_rx.recv() => {
                    if self.handle_output(chunk) {
                        watchdog_armed = false;
                    }
                }
                Some(message) = control_rx.recv() => match message {
                    ControlMessage::Terminate => terminate_child(&mut child),
                    ControlMessage::TimeoutChanged(timeout_ms) => {
                        deadline = startup_deadline(started_at, timeout_ms);
                        watchdog_armed = deadline.is_some();
                    }
                },
                _ = watchdog(deadline), if watchdog_armed => {
                    watchdog_armed = false;
                    self.trip_watchdog(&mut child);
                }
                exit = child.wait() => break exit,
            }
        };

        // The readers may still be flushing what the child wrote on the way
        // out; give them a bounded quiet period so a stray grandchild holding
        // the pipes open cannot stall the exit transition.
        loop {
            match tokio::time::timeout(OUTPUT_DRAIN_QUIET, output_rx.recv()).await {
                Ok(Some(chunk)) => {
                    self.handle_output(chunk);
                }
                Ok(None) | Err(_) => break,
            }
        }

        self.finish(exit_result);
    }

    /// Appends one output chunk to the log and, while starting, scans it for
    /// the readiness banner. Returns whether the run just became ready.
    fn handle_output(&mut self, chunk: String) -> bool {
        if self.debug_echo {
            let text = chunk.trim_end();
            debug!("server output: {text}");
        }
        let Ok(mut run) = self.inner.run.lock() else {
            return false;
        };
        // After the watchdog tripped, termination is already in flight; a
        // late banner must not resurrect the run.
        let scanning = run.status == EnvironmentStatus::Starting && !run.timed_out;
        let address = if scanning {
            self.scanner.scan(&chunk)
        } else {
            None
        };
        run.log.push(chunk);
        let Some(address) = address else {
            return false;
        };
        debug!(port = address.port, "server is ready");
        run.port = Some(address.port);
        run.token = Some(address.token);
        run.status = EnvironmentStatus::Running;
        self.inner.queue_event(EnvironmentEvent::Ready);
        self.inner.queue_event(EnvironmentEvent::Change);
        true
    }

    fn trip_watchdog(&self, child: &mut Child) {
        {
            let Ok(mut run) = self.inner.run.lock() else {
                return;
            };
            if run.status != EnvironmentStatus::Starting {
                return;
            }
            run.timed_out = true;
        }
        warn!("server did not become ready in time; requesting termination");
        terminate_child(child);
    }

    /// Classifies the observed exit, clears the run, and notifies.
    fn finish(&self, exit_result: io::Result<ExitStatus>) {
        let Ok(mut run) = self.inner.run.lock() else {
            return;
        };
        let exit_code = match &exit_result {
            Ok(status) => {
                debug!(code = ?status.code(), "server process exited");
                status.code()
            }
            Err(err) => {
                warn!(error = %err, "failed to observe the server exit");
                None
            }
        };
        let error = if exit_code.is_some_and(|code| code != 0) {
            Some(EnvironmentError::CrashedWithError)
        } else if run.timed_out {
            Some(EnvironmentError::StartupTimeout)
        } else if run.status == EnvironmentStatus::Starting {
            Some(EnvironmentError::ExitedWithoutReachingReady)
        } else {
            None
        };

        run.status = EnvironmentStatus::Exited;
        run.mode = None;
        run.port = None;
        run.token = None;
        run.timed_out = false;
        run.control = None;
        if let Some(error) = error {
            warn!(error = %error, "server run ended abnormally");
            self.inner.queue_event(EnvironmentEvent::Error(error));
        }
        self.inner.queue_event(EnvironmentEvent::Exit);
        self.inner.queue_event(EnvironmentEvent::Change);
    }
}

fn startup_deadline(started_at: Instant, timeout_ms: u64) -> Option<Instant> {
    if timeout_ms == 0 {
        return None;
    }
    // A delay past the clock's range leaves the watchdog unarmed.
    started_at.checked_add(Duration::from_millis(timeout_ms))
}

async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn terminate_child(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SIGTERM is the shutdown the notebook server handles gracefully.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(pid, "failed to signal the server process");
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(error = %err, "failed to kill the server process");
    }
}

async fn forward_output<R>(mut reader: R, chunks: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => {
                let chunk = String::from_utf8_lossy(&buffer[..read]).into_owned();
                if chunks.send(chunk).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "server output stream failed");
                break;
            }
        }
    }
}

async fn dispatch_events(
    inner: Weak<EnvironmentInner>,
    mut events: mpsc::UnboundedReceiver<EnvironmentEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let environment = JupyterEnvironment { inner };
        let listeners = environment.inner.listeners.take_for_dispatch(event.kind());
        for listener in listeners {
            listener(&environment, &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_environment() -> JupyterEnvironment {
        JupyterEnvironment::new(std::env::temp_dir(), EnvironmentConfig::default())
    }

    fn inject_running(env: &JupyterEnvironment, port: u16, token: &str, mode: ServerMode) {
        let mut run = env.inner.run.lock().unwrap();
        run.status = EnvironmentStatus::Running;
        run.port = Some(port);
        run.token = Some(token.to_string());
        run.mode = Some(mode);
    }

    #[tokio::test]
    async fn fresh_environment_is_exited_and_empty() {
        let env = test_environment();
        assert_eq!(env.status(), EnvironmentStatus::Exited);
        assert!(!env.is_alive());
        assert!(!env.is_running());
        assert_eq!(env.port(), None);
        assert_eq!(env.token(), None);
        assert_eq!(env.running_mode(), None);
        assert_eq!(env.log(), Vec::<String>::new());
        assert_eq!(env.last_log_entry(), "");
        assert_eq!(env.server_url(), None);
        assert_eq!(env.file_url("notes/demo.ipynb"), None);
    }

    #[tokio::test]
    async fn exit_while_exited_emits_nothing() {
        let env = test_environment();
        let (tx, mut rx) = mpsc::unbounded_channel();
        env.subscribe(EnvironmentEventKind::Exit, move |_env, event| {
            let _ = tx.send(*event);
        });

        env.exit();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no Exit may fire while exited");
    }

    #[tokio::test]
    async fn mutators_record_settings_for_the_next_run() {
        let env = test_environment();
        env.set_mode(ServerMode::Lab);
        env.set_debug_echo(true);
        env.set_startup_timeout_ms(1_234);
        env.set_executable(PythonExecutable::Path("/opt/venv/bin/python".into()));

        let config = env.config();
        assert_eq!(config.mode, ServerMode::Lab);
        assert!(config.debug_echo);
        assert_eq!(config.startup_timeout_ms, 1_234);
        assert_eq!(
            config.executable,
            PythonExecutable::Path("/opt/venv/bin/python".into())
        );
        // Recording a mode does not touch the (nonexistent) current run.
        assert_eq!(env.running_mode(), None);
    }

    #[tokio::test]
    async fn file_url_follows_the_mode_of_the_run() {
        let env = test_environment();
        inject_running(&env, 8888, "abc123", ServerMode::Notebook);
        assert_eq!(
            env.file_url("notes/demo.ipynb").as_deref(),
            Some("http://localhost:8888/notebooks/notes/demo.ipynb?token=abc123")
        );
        assert_eq!(
            env.server_url().as_deref(),
            Some("http://localhost:8888/?token=abc123")
        );

        let env = test_environment();
        inject_running(&env, 9999, "s3cret", ServerMode::Lab);
        assert_eq!(
            env.file_url("demo.ipynb").as_deref(),
            Some("http://localhost:9999/lab/tree/demo.ipynb?token=s3cret")
        );
    }

    #[tokio::test]
    async fn queued_events_reach_subscribers_in_order() {
        let env = test_environment();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for kind in [
            EnvironmentEventKind::Starting,
            EnvironmentEventKind::Ready,
            EnvironmentEventKind::Change,
        ] {
            let tx = tx.clone();
            env.subscribe(kind, move |_env, event| {
                let _ = tx.send(*event);
            });
        }

        env.inner.queue_event(EnvironmentEvent::Starting);
        env.inner.queue_event(EnvironmentEvent::Change);
        env.inner.queue_event(EnvironmentEvent::Ready);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event should arrive")
                .expect("channel open");
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                EnvironmentEvent::Starting,
                EnvironmentEvent::Change,
                EnvironmentEvent::Ready,
            ]
        );
    }

    #[tokio::test]
    async fn listeners_can_requery_the_controller() {
        let env = test_environment();
        inject_running(&env, 8080, "tok", ServerMode::Notebook);
        let (tx, mut rx) = mpsc::unbounded_channel();
        env.subscribe(EnvironmentEventKind::Ready, move |env, _event| {
            let _ = tx.send(env.port());
        });

        env.inner.queue_event(EnvironmentEvent::Ready);
        let port = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open");
        assert_eq!(port, Some(8080));
    }

    #[test]
    fn startup_deadline_handles_zero_and_oversized_delays() {
        let now = Instant::now();
        assert_eq!(startup_deadline(now, 0), None);
        assert_eq!(
            startup_deadline(now, 250),
            Some(now + Duration::from_millis(250))
        );
        // Past the clock's range the watchdog stays unarmed instead of
        // panicking.
        if let Some(deadline) = startup_deadline(now, u64::MAX) {
            assert!(deadline > now);
        }
    }
}
