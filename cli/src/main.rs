use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::ValueEnum;
use nbhost_core::DEFAULT_STARTUP_TIMEOUT_MS;
use nbhost_core::EnvironmentConfig;
use nbhost_core::EnvironmentError;
use nbhost_core::EnvironmentEvent;
use nbhost_core::EnvironmentEventKind;
use nbhost_core::JupyterEnvironment;
use nbhost_core::PythonExecutable;
use nbhost_core::ServerMode;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "nbhost",
    version,
    about = "Serve a directory with a local Jupyter notebook or lab server"
)]
struct Cli {
    /// Directory the server exposes.
    #[arg(value_name = "ROOT", default_value = ".")]
    root: PathBuf,

    /// Python interpreter to launch; defaults to `python` from PATH.
    #[arg(long = "python", value_name = "PATH")]
    python: Option<PathBuf>,

    /// Server variant to launch.
    #[arg(long = "mode", value_enum, default_value_t = ModeArg::Notebook)]
    mode: ModeArg,

    /// Startup watchdog delay in milliseconds; 0 disables it.
    #[arg(
        long = "timeout-ms",
        value_name = "MILLIS",
        default_value_t = DEFAULT_STARTUP_TIMEOUT_MS
    )]
    timeout_ms: u64,

    /// Echo server output into the host log.
    #[arg(long = "debug-echo")]
    debug_echo: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Notebook,
    Lab,
}

impl From<ModeArg> for ServerMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Notebook => ServerMode::Notebook,
            ModeArg::Lab => ServerMode::Lab,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    run(Cli::parse()).await
}

fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("cannot resolve root directory {}", cli.root.display()))?;
    anyhow::ensure!(root.is_dir(), "root {} is not a directory", root.display());

    let config = EnvironmentConfig {
        executable: match cli.python {
            Some(path) => PythonExecutable::Path(path),
            None => PythonExecutable::Python,
        },
        mode: cli.mode.into(),
        startup_timeout_ms: cli.timeout_ms,
        debug_echo: cli.debug_echo,
    };
    let environment = JupyterEnvironment::new(&root, config);
    let mut events = subscribe_all(&environment);

    info!(root = %root.display(), "starting the server");
    environment.start();

    let mut shutdown_requested = false;
    let mut last_error = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !shutdown_requested => {
                shutdown_requested = true;
                info!("shutting down the server");
                environment.exit();
            }
            event = events.recv() => match event {
                Some(EnvironmentEvent::Ready) => {
                    // The URL goes to stdout so it can be piped; everything
                    // else logs to stderr.
                    if let Some(url) = environment.server_url() {
                        println!("{url}");
                    }
                    info!("server is ready; press Ctrl-C to stop");
                }
                Some(EnvironmentEvent::Error(EnvironmentError::UnableToStart)) => {
                    // No process was spawned, so no Exit will follow.
                    return Err(EnvironmentError::UnableToStart.into());
                }
                Some(EnvironmentEvent::Error(error)) => last_error = Some(error),
                Some(EnvironmentEvent::Exit) => break,
                Some(_) => {}
                None => break,
            }
        }
    }
    match last_error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

fn subscribe_all(environment: &JupyterEnvironment) -> mpsc::UnboundedReceiver<EnvironmentEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [
        EnvironmentEventKind::Starting,
        EnvironmentEventKind::Ready,
        EnvironmentEventKind::Exit,
        EnvironmentEventKind::Error,
    ] {
        let tx = tx.clone();
        environment.subscribe(kind, move |_environment, event| {
            let _ = tx.send(*event);
        });
    }
    rx
}
