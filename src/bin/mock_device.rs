use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use gonio_lib::config::{DEFAULT_HOST, DEFAULT_PORT};
use gonio_rs::logging::setup_logging;
use gonio_rs::mock::{MockGoniometer, serve, simulate};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A simulated goniometer: accepts console connections, executes commands
/// and streams position telemetry.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Telemetry period in milliseconds.
    #[arg(short, long, default_value_t = 50)]
    interval_ms: u64,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Mock goniometer listening");

    // One physical device, shared by every connection.
    let device = Arc::new(Mutex::new(MockGoniometer::default()));
    let interval = Duration::from_millis(cli.interval_ms.max(1));
    tokio::spawn(simulate(Arc::clone(&device), interval));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                info!(%peer, "Console connected");
                let device = Arc::clone(&device);
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, peer, device, interval).await {
                        warn!(%peer, "Connection ended with error: {:#}", e);
                    }
                    info!(%peer, "Console disconnected");
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down.");
                return Ok(());
            }
        }
    }
}
