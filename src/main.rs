//! backup-peer CLI entrypoint: loads configuration, brings up the peer
//! core, and runs until terminated.

use std::sync::Arc;

use backup_peer::app::PeerApp;
use backup_peer::config::Config;
use backup_peer::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "backup-peer")]
#[command(about = "Mutual peer-to-peer encrypted backup exchange")]
struct Args {
    /// Override the configured log level (defaults to BACKUP_PEER_LOG_LEVEL).
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;

    let filter = args.log_level.as_deref().unwrap_or(&config.log_level).to_string();
    fmt().with_env_filter(EnvFilter::new(filter)).init();

    let app = Arc::new(PeerApp::new(config)?);
    app.run().await?;

    tracing::info!("backup-peer running; press ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
    Ok(())
}
