use std::process::ExitCode;
use std::time::Duration;

use assist_core::config::{self, AppConfig};
use assist_core::daemon::{self, DaemonStatus, ScanRequest};
use assist_core::events::CursorRegistry;
use clap::{Parser, Subcommand};
use cli::api::{self, AppState};
use cli::{paths, pidfile};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_STATE: u8 = 2;
const EXIT_STORE: u8 = 3;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "depot-assist")]
#[command(about = "File metadata assistant daemon", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Stay attached to the terminal instead of detaching
        #[arg(long)]
        foreground: bool,
        /// Override the control-plane bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the control-plane port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stop a running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Stop, then start again
    Restart,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut cfg = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error loading configuration: {err}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let code = match cli.command {
        Commands::Start {
            foreground,
            host,
            port,
        } => {
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if foreground {
                run_foreground(cfg)
            } else {
                start_detached(&cli.config, &cfg)
            }
        }
        Commands::Stop => block_on(stop(&cfg)),
        Commands::Status => block_on(status(&cfg)),
        Commands::Restart => {
            // "Not running" is fine for a restart; a stop failure is not.
            let stopped = block_on(stop(&cfg));
            if stopped == EXIT_ERROR {
                stopped
            } else {
                start_detached(&cli.config, &cfg)
            }
        }
    };
    ExitCode::from(code)
}

fn block_on(fut: impl std::future::Future<Output = u8>) -> u8 {
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(fut),
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            EXIT_ERROR
        }
    }
}

/// Run the daemon attached: workers plus control plane until shutdown.
fn run_foreground(cfg: AppConfig) -> u8 {
    init_tracing();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            return EXIT_ERROR;
        }
    };
    runtime.block_on(async move {
        if already_running(&cfg).await {
            eprintln!("daemon already running on port {}", cfg.server.port);
            return EXIT_STATE;
        }
        let store = match storage::open(&cfg.database.path).await {
            Ok(store) => store,
            Err(err) => {
                error!(error = %err, "store is unhealthy, refusing to start");
                return EXIT_STORE;
            }
        };
        let pid = paths::pid_path();
        if let Err(err) = pidfile::write(&pid) {
            error!(error = %err, "cannot write pid file");
            return EXIT_ERROR;
        }

        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let (scan_tx, scan_rx) = mpsc::channel::<ScanRequest>(64);
        let status = DaemonStatus::default();
        let cursors = CursorRegistry::new();

        let workers = {
            let store = store.clone();
            let cfg = cfg.clone();
            let cursors = cursors.clone();
            let status = status.clone();
            let shutdown = shutdown_tx.clone();
            tokio::spawn(async move {
                daemon::run(store, cfg, cursors, status, scan_rx, shutdown).await
            })
        };

        let signal = {
            let shutdown = shutdown_tx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received ctrl-c, shutting down");
                    let _ = shutdown.send(());
                }
            })
        };

        let state = AppState {
            store,
            config: cfg,
            status,
            cursors,
            scan_tx,
            shutdown: shutdown_tx.clone(),
            started_at: storage::unix_now(),
        };
        let served = api::serve(state).await;
        let _ = shutdown_tx.send(());
        let _ = workers.await;
        signal.abort();
        pidfile::remove(&pid);

        match served {
            Ok(()) => EXIT_OK,
            Err(err) => {
                error!(error = %err, "control plane failed");
                EXIT_ERROR
            }
        }
    })
}

/// Re-exec ourselves detached with --foreground, logging to the data dir.
fn start_detached(config_flag: &Option<String>, cfg: &AppConfig) -> u8 {
    let running = block_on(async { u8::from(already_running(cfg).await) });
    if running == 1 {
        eprintln!("daemon already running on port {}", cfg.server.port);
        return EXIT_STATE;
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            eprintln!("cannot determine own executable: {err}");
            return EXIT_ERROR;
        }
    };
    let log = paths::log_path();
    if let Some(parent) = log.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let open_log = || {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
    };
    let (stdout, stderr) = match (open_log(), open_log()) {
        (Ok(out), Ok(err)) => (out, err),
        _ => {
            eprintln!("cannot open log file {}", log.display());
            return EXIT_ERROR;
        }
    };

    let mut command = std::process::Command::new(exe);
    command
        .arg("start")
        .arg("--foreground")
        .arg("--host")
        .arg(&cfg.server.host)
        .arg("--port")
        .arg(cfg.server.port.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    if let Some(config_path) = config_flag {
        command.arg("--config").arg(config_path);
    }
    match command.spawn() {
        Ok(child) => {
            println!("daemon started (pid {})", child.id());
            EXIT_OK
        }
        Err(err) => {
            eprintln!("failed to start daemon: {err}");
            EXIT_ERROR
        }
    }
}

async fn stop(cfg: &AppConfig) -> u8 {
    let base = control_url(cfg);
    let response = reqwest::Client::new()
        .post(format!("{base}/api/shutdown"))
        .timeout(HTTP_TIMEOUT)
        .send()
        .await;
    if response.is_err() {
        eprintln!("daemon is not running");
        return EXIT_STATE;
    }
    // Wait for the control plane to go away and the recorded process to
    // actually exit, so an immediate restart does not trip the guard.
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if daemon_alive(cfg).await {
            continue;
        }
        match pidfile::read(&paths::pid_path()) {
            Some(pid) if pidfile::alive(pid) => continue,
            _ => {
                println!("daemon stopped");
                return EXIT_OK;
            }
        }
    }
    eprintln!("daemon did not stop in time");
    EXIT_ERROR
}

async fn status(cfg: &AppConfig) -> u8 {
    let base = control_url(cfg);
    let request = reqwest::Client::new()
        .get(format!("{base}/status"))
        .timeout(HTTP_TIMEOUT);
    let response = match request.send().await {
        Ok(response) => response,
        Err(_) => {
            eprintln!("daemon is not running");
            return EXIT_STATE;
        }
    };
    match response.json::<serde_json::Value>().await {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            EXIT_OK
        }
        Err(err) => {
            eprintln!("bad status response: {err}");
            EXIT_ERROR
        }
    }
}

/// Double-start guard. The pid file names the previous daemon; when the
/// control plane is not answering (not bound yet, or bound to another
/// port), a signal-0 check on the recorded pid decides.
async fn already_running(cfg: &AppConfig) -> bool {
    if daemon_alive(cfg).await {
        return true;
    }
    match pidfile::read(&paths::pid_path()) {
        Some(pid) => pidfile::alive(pid),
        None => false,
    }
}

async fn daemon_alive(cfg: &AppConfig) -> bool {
    reqwest::Client::new()
        .get(format!("{}/health", control_url(cfg)))
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .map(|r| r.status().is_success() || r.status().as_u16() == 503)
        .unwrap_or(false)
}

fn control_url(cfg: &AppConfig) -> String {
    format!("http://{}:{}", cfg.server.host, cfg.server.port)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
