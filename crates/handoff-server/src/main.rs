//! handoff-server: an HTTP server that restarts in place.
//!
//! Started cold, the process binds its listeners and becomes the supervisor:
//! it spawns itself as a child generation that inherits the sockets and
//! serves them. `GET /restart` or `SIGHUP` in the child drains it and the
//! supervisor spawns the next generation on the same sockets.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use handoff::{run_supervised, self_executable, HandoffConfig, Startup, DEPLOYMENT_MISMATCH_EXIT_CODE};
use tracing::{error, info};

mod routes;
mod server;
mod telemetry;

use telemetry::LogFormat;

/// One named listener, given on the command line as `NAME=ADDR`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenSpec {
    name: String,
    addr: String,
}

impl FromStr for ListenSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, addr) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=ADDR, got {s:?}"))?;
        if name.is_empty() || addr.is_empty() {
            return Err(format!("expected NAME=ADDR, got {s:?}"));
        }
        Ok(Self {
            name: name.to_string(),
            addr: addr.to_string(),
        })
    }
}

/// HTTP server with zero-downtime restarts
#[derive(Parser, Debug)]
#[command(name = "handoff-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listener to serve as NAME=ADDR; repeat for more than one
    #[arg(
        short,
        long = "listen",
        value_name = "NAME=ADDR",
        env = "HANDOFF_LISTEN",
        value_delimiter = ',',
        default_value = "http=127.0.0.1:8080"
    )]
    listen: Vec<ListenSpec>,

    /// Address family: tcp, tcp4 or tcp6
    #[arg(long, env = "HANDOFF_NETWORK", default_value = "tcp")]
    network: String,

    /// Serve directly from the cold process instead of supervising children
    #[arg(long)]
    no_supervise: bool,

    /// Seconds to wait for connections to drain on stop or restart
    /// [default: HANDOFF_DRAIN_TIMEOUT_SECS or 30]
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Milliseconds to wait before respawning a failed generation
    /// [default: HANDOFF_RESPAWN_BACKOFF_MS or 1000]
    #[arg(long)]
    respawn_backoff_ms: Option<u64>,

    /// Default delay of the /sleep route, in seconds
    #[arg(long, default_value_t = 50)]
    sleep_secs: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Cli {
    /// Environment settings, overridden by explicit flags.
    fn handoff_config(&self) -> HandoffConfig {
        let mut config = HandoffConfig::from_env();
        if let Some(secs) = self.drain_timeout_secs {
            config = config.with_grace_period(Duration::from_secs(secs));
        }
        if let Some(ms) = self.respawn_backoff_ms {
            config = config.with_respawn_backoff(Duration::from_millis(ms));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format).map_err(|e| anyhow::anyhow!(e))?;

    info!("handoff-server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Resolved before anything can replace the binary on disk.
    let exe = self_executable().context("failed to resolve own executable")?;

    let mut startup = Startup::from_env(cli.handoff_config()).context("failed to read handoff environment")?;

    let mut listeners = Vec::with_capacity(cli.listen.len());
    for spec in &cli.listen {
        let listener = match startup.acquire_http(&spec.name, &cli.network, &spec.addr) {
            Ok(listener) => listener,
            Err(e) if e.is_deployment_mismatch() => {
                error!(
                    listener = %spec.name,
                    error = %e,
                    "Inherited listeners do not match this build's configuration"
                );
                // Tells the supervisor not to respawn this binary.
                std::process::exit(DEPLOYMENT_MISMATCH_EXIT_CODE);
            }
            Err(e) => return Err(e).with_context(|| format!("failed to acquire listener {}", spec.name)),
        };
        info!(listener = %spec.name, addr = ?listener.local_addr().ok(), "Listener ready");
        listeners.push((spec.name.clone(), listener));
    }

    let generation = startup.finish();

    if !generation.is_warm() && !cli.no_supervise {
        // The registry keeps the sockets open for the children.
        drop(listeners);
        let args = generation.args().to_vec();
        let status = run_supervised(generation, exe, args)
            .await
            .context("supervisor failed")?;
        info!(%status, "Supervisor exiting");
        return Ok(());
    }

    server::run(generation, listeners, Duration::from_secs(cli.sleep_secs)).await
}
