//! Service entry point: environment bootstrap, tracing, database, status API,
//! and the tick loop, with a cooperative shutdown on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tradewatch_backend::{
    api::{self, ApiState},
    reasoning::SubprocessInvoker,
    service::DEFAULT_TICK_INTERVAL,
    storage::StoreError,
    Db, Pipeline, Scheduler, ServiceLoop, Settings, ShutdownToken, TradingCalendar,
    WatchlistManager,
};

#[derive(Parser, Debug)]
#[command(name = "tradewatch", about = "Autonomous trading-analysis orchestrator")]
struct Args {
    /// SQLite database path.
    #[arg(long, env = "TRADEWATCH_DB", default_value = "tradewatch.db")]
    db_path: PathBuf,

    /// Directory for analysis artifacts.
    #[arg(long, env = "TRADEWATCH_ANALYSES_DIR", default_value = "analyses")]
    analyses_dir: PathBuf,

    /// Reasoning engine binary.
    #[arg(long, env = "TRADEWATCH_ENGINE", default_value = "claude")]
    engine: String,

    /// Working directory handed to the engine.
    #[arg(long, env = "TRADEWATCH_ENGINE_DIR", default_value = ".")]
    engine_dir: PathBuf,

    /// Bind address for the read-only status API.
    #[arg(long, env = "TRADEWATCH_API_ADDR", default_value = "127.0.0.1:8090")]
    api_addr: SocketAddr,

    /// Seconds between service ticks.
    #[arg(long, env = "TRADEWATCH_TICK_SECONDS")]
    tick_seconds: Option<u64>,
}

async fn run(args: Args) -> Result<()> {
    let db = Db::open(&args.db_path)?;
    let settings = Settings::new(db.clone());

    // RUST_LOG wins; otherwise the persisted log_level setting seeds the
    // default filter.
    let default_level = settings.log_level().await;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(db = %args.db_path.display(), "starting tradewatch");

    tokio::fs::create_dir_all(&args.analyses_dir)
        .await
        .with_context(|| format!("create {}", args.analyses_dir.display()))?;

    let calendar = TradingCalendar::new();
    let invoker = Arc::new(SubprocessInvoker::new(
        args.engine.clone(),
        args.engine_dir.clone(),
        settings.clone(),
    ));

    // Vector and graph stores are external collaborators, attached when their
    // bindings are deployed alongside; the pipeline degrades without them.
    let pipeline = Arc::new(Pipeline::new(
        db.clone(),
        settings.clone(),
        calendar.clone(),
        invoker,
        None,
        None,
        args.analyses_dir.clone(),
    ));
    let scheduler = Scheduler::new(db.clone(), settings.clone(), calendar.clone(), pipeline);
    let watchlist = WatchlistManager::new(db.clone());
    let tick = args
        .tick_seconds
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TICK_INTERVAL);
    let service = ServiceLoop::new(db.clone(), calendar, scheduler, watchlist, tick);

    let shutdown = ShutdownToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(args.api_addr)
        .await
        .with_context(|| format!("bind {}", args.api_addr))?;
    info!(addr = %args.api_addr, "status API listening");
    {
        let router = api::router(ApiState { db });
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "status API failed");
            }
        });
    }

    service.run(shutdown).await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            // Exit-code contract: 2 = persistence unavailable, 1 = anything
            // else (internal invariant).
            if e.chain().any(|c| {
                c.downcast_ref::<StoreError>().is_some()
                    || c.downcast_ref::<rusqlite::Error>().is_some()
            }) {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
