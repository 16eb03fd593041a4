//! hacknet server CLI
//!
//! Loads (or seeds) every configured World, then ticks them while serving
//! players over TCP until interrupted.

use clap::Parser;
use hacknet_core::{CommandQueue, SledStore};
use hacknet_env::{TokioClock, WorldId};
use hacknet_server::{bootstrap, net, ServerConfig, ServerError, TickDriver};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// hacknet world server
#[derive(Parser, Debug)]
#[command(name = "hacknet-server")]
#[command(about = "Run the hacknet world server", long_about = None)]
struct Args {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Database directory for World snapshots
    #[arg(long)]
    db: Option<PathBuf>,

    /// Target tick period in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Seconds between persistence syncs (0 = only on shutdown)
    #[arg(long)]
    sync_secs: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, ServerError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(db) = self.db {
            config.db_path = db;
        }
        if let Some(tick_ms) = self.tick_ms {
            config.tick_ms = tick_ms;
        }
        if let Some(sync_secs) = self.sync_secs {
            config.sync_secs = sync_secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ServerError> {
    let config = args.into_config()?;
    info!("hacknet server v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(SledStore::open(&config.db_path)?);
    let queue = Arc::new(CommandQueue::new());
    let worlds = bootstrap::load_worlds(&config, store.as_ref(), bootstrap::builtin_registry(), queue.clone())?;
    let listener = TcpListener::bind(config.listen).await?;

    let mut driver = TickDriver::new(TokioClock::shared(), worlds, queue.clone(), store, &config);
    let stop = driver.stop_handle();
    let ticking = tokio::spawn(async move { driver.run().await });

    tokio::select! {
        _ = net::serve(listener, queue, WorldId(0)) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("shutdown requested");
        }
    }

    stop.store(true, Ordering::Release);
    let completed = ticking
        .await
        .map_err(|e| ServerError::Driver(e.to_string()))?;
    info!(completed, "server stopped");
    Ok(())
}
