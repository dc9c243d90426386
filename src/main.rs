//! Claudish binary: `claudish serve` runs the Messages proxy, `claudish
//! bridge` runs the control-plane server. Everything else — profiles, child
//! process management, OS proxy wiring — belongs to the host CLI.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use claudish::config::load_config;
use claudish::model::EnvCredentials;

#[derive(Parser)]
#[command(name = "claudish")]
#[command(about = "Anthropic Messages proxy for non-Anthropic models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Messages proxy (default).
    Serve {
        /// Port to listen on; 0 picks the default range.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the bridge control plane for a host UI.
    Bridge,
}

/// Initialise the tracing subscriber on stderr.
///
/// Stdout is reserved for machine-readable output (the bridge discovery
/// lines), so all diagnostics go to stderr. Verbosity is controlled by
/// `RUST_LOG` (defaults to `info`). `log::` call sites are forwarded into
/// the tracing pipeline via `LogTracer`.
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .ok();

    // Forward all log:: macro call sites into the tracing pipeline.
    tracing_log::LogTracer::init().ok();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "claudish starting");

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Bridge) => claudish::bridge::serve().await?,
        Some(Commands::Serve { port }) => {
            let mut config = load_config();
            if let Some(port) = port {
                config.port = port;
            }
            claudish::server::serve(config, Arc::new(EnvCredentials)).await?;
        }
        None => {
            let config = load_config();
            claudish::server::serve(config, Arc::new(EnvCredentials)).await?;
        }
    }
    Ok(())
}
