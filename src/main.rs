//! trail - behavioral telemetry daemon
//!
//! Runs the telemetry engine behind a Unix socket. Hosts stream tracked
//! events and raw activity/visibility signals as newline-delimited JSON.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use trail::{
    BestEffortStore, DiscardTransport, EndReason, Engine, EngineConfig, FileStore, HttpTransport,
    MemoryStore, SourceCatalog, SystemClock, TrackerRegistry, Transport, config, ipc, server,
};

/// Time left for detached beacon requests before the process exits.
const BEACON_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "trail", about = "Behavioral telemetry daemon")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start the engine and the socket server (default)
    Run {
        /// Override the events endpoint
        #[arg(long)]
        endpoint: Option<String>,
        /// Socket path (defaults to `$TMPDIR/trail.sock`)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Forward host messages from stdin (one JSON object per line) to the daemon
    Send {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Print the effective configuration and where it is read from
    Config {
        /// Also write it to the config path
        #[arg(long)]
        write: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("TRAIL_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn load(cli_path: Option<&PathBuf>) -> (EngineConfig, Option<PathBuf>) {
    match cli_path {
        Some(path) => (config::load_config_from(path), Some(path.clone())),
        None => (config::load_config(), config::default_config_path()),
    }
}

fn build_transport(config: &EngineConfig) -> Arc<dyn Transport> {
    if config.endpoint.trim().is_empty() {
        warn!("no endpoint configured, payloads will be discarded");
        return Arc::new(DiscardTransport);
    }
    match HttpTransport::new(&config.endpoint, config.request_timeout()) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            warn!(error = %e, "http transport unavailable, payloads will be discarded");
            Arc::new(DiscardTransport)
        }
    }
}

fn build_store(config: &EngineConfig) -> BestEffortStore {
    let file_store = config
        .storage_dir
        .clone()
        .map(FileStore::new)
        .or_else(FileStore::in_data_dir);
    match file_store {
        Some(store) => {
            info!("persisting state in {}", store.dir().display());
            BestEffortStore::new(store)
        }
        None => {
            warn!("no data directory, state will not survive restarts");
            BestEffortStore::new(MemoryStore::new())
        }
    }
}

async fn run(mut config: EngineConfig, endpoint: Option<String>, socket: Option<PathBuf>) {
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    if let Err(e) = config.validate() {
        warn!(error = %e, "invalid configuration, using defaults");
        config = EngineConfig {
            endpoint: config.endpoint,
            ..EngineConfig::default()
        };
    }

    let trackers = TrackerRegistry::from_config(&config, &SourceCatalog::builtin());
    let transport = build_transport(&config);
    let store = Arc::new(build_store(&config));
    let engine = Engine::new(
        config,
        transport,
        store,
        Arc::new(SystemClock::new()),
        trackers,
    );
    engine.start().await;

    let path = socket.unwrap_or_else(ipc::socket_path);
    let listener = match server::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Failed to bind Unix socket {}: {}", path.display(), e);
            engine.teardown(EndReason::Teardown).await;
            return;
        }
    };
    let unloaded = Arc::new(Notify::new());
    let server = tokio::spawn(server::serve(listener, engine.clone(), Arc::clone(&unloaded)));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            engine.teardown(EndReason::Unload).await;
        }
        _ = unloaded.notified() => {}
    }

    server.abort();
    if let Err(e) = std::fs::remove_file(&path) {
        warn!("Failed to remove socket {}: {}", path.display(), e);
    }
    tokio::time::sleep(BEACON_GRACE).await;
    info!("daemon stopped");
}

fn print_config(config: &EngineConfig, path: Option<&PathBuf>) {
    match path {
        Some(path) => println!("# {}", path.display()),
        None => println!("# (no config directory)"),
    }
    match serde_json::to_string_pretty(config) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}

fn main() {
    let cli = Cli::parse();
    let (config, path) = load(cli.config.as_ref());

    match cli.command {
        Some(Command::Config { write }) => {
            print_config(&config, path.as_ref());
            if write && let Some(path) = &path {
                if let Err(e) = config::save_config_to(&config, path) {
                    eprintln!("failed to write {}: {e}", path.display());
                    std::process::exit(1);
                }
                println!("# written to {}", path.display());
            }
            return;
        }
        Some(Command::Send { socket }) => {
            let path = socket.unwrap_or_else(ipc::socket_path);
            let stdin = std::io::stdin().lock();
            if let Err(e) = ipc::forward_lines(&path, stdin) {
                eprintln!("daemon not running ({:?}): {}", path.display(), e);
                std::process::exit(1);
            }
            return;
        }
        _ => {}
    }

    init_tracing(cli.verbose);

    let (endpoint, socket) = match cli.command {
        Some(Command::Run { endpoint, socket }) => (endpoint, socket),
        _ => (None, None),
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    runtime.block_on(run(config, endpoint, socket));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_no_subcommand() {
        let cli = Cli::try_parse_from(["trail"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn cli_verbose_three() {
        let cli = Cli::try_parse_from(["trail", "-vvv"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn cli_run_with_endpoint() {
        let cli = Cli::try_parse_from([
            "trail",
            "run",
            "--endpoint",
            "https://collect.example.com/events",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Some(Command::Run { endpoint, socket }) => {
                assert_eq!(endpoint.as_deref(), Some("https://collect.example.com/events"));
                assert!(socket.is_none());
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_send_with_socket() {
        let cli = Cli::try_parse_from(["trail", "send", "--socket", "/tmp/x.sock"]).unwrap();
        match cli.command {
            Some(Command::Send { socket }) => {
                assert_eq!(socket, Some(PathBuf::from("/tmp/x.sock")));
            }
            _ => panic!("expected Send command"),
        }
    }

    #[test]
    fn cli_config_path_is_global() {
        let cli = Cli::try_parse_from(["trail", "config", "--config", "/etc/trail.json"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Config { write: false })));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/trail.json")));
    }

    #[test]
    fn cli_config_write() {
        let cli = Cli::try_parse_from(["trail", "config", "--write"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Config { write: true })));
    }

    #[test]
    fn empty_endpoint_uses_discard_transport() {
        // Building must not fail without an endpoint
        let _transport = build_transport(&EngineConfig::default());
    }
}
