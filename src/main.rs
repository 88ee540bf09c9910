use anyhow::Result;
use chrono::Days;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use g6_platform::config::{AppConfig, ConfigError};
use g6_platform::context::AppContext;
use g6_platform::cycle::CycleExecutor;
use g6_platform::market_calendar::ist_now;
use g6_platform::provider::{MarketProvider, SimulatedProvider};
use g6_platform::sse_server;

/// G6 collection orchestrator.
#[derive(Debug, Parser)]
#[command(name = "g6", about = "Options-market data collection and observability platform")]
struct Cli {
    /// JSON configuration file (optional; env and defaults otherwise).
    #[arg(long)]
    config: Option<String>,

    /// Cycle interval in seconds.
    #[arg(long)]
    interval: Option<u64>,

    /// Stop after N cycles.
    #[arg(long)]
    cycles: Option<u64>,

    /// Parallel per-index workers.
    #[arg(long)]
    parallel: Option<usize>,

    /// Emit a full panel snapshot every cycle cadence tick.
    #[arg(long)]
    auto_snapshots: bool,

    /// Run exactly one cycle and exit.
    #[arg(long)]
    run_once: bool,

    /// Log level (trace|debug|info|warn|error).
    #[arg(long, env = "G6_LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<AppConfig, ConfigError> {
    let mut cfg = AppConfig::load(cli.config.as_deref())?;
    // CLI wins over everything.
    if let Some(interval) = cli.interval {
        cfg.schedule.interval_secs = interval;
    }
    if let Some(cycles) = cli.cycles {
        cfg.schedule.max_cycles = Some(cycles);
    }
    if let Some(workers) = cli.parallel {
        cfg.schedule.parallel_index_workers = workers;
    }
    if cli.auto_snapshots {
        cfg.panels.auto_snapshots = true;
    }
    if cli.run_once {
        cfg.schedule.run_once = true;
    }
    if let Some(level) = &cli.log_level {
        cfg.log_level = level.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Default provider wiring: the deterministic simulator, primary plus a
/// secondary standing in for a real broker adapter pair. Deployments with
/// a live broker register their own `MarketProvider` implementations here.
fn default_providers() -> Vec<(String, Arc<dyn MarketProvider>)> {
    let today = ist_now().date_naive();
    let expiries: Vec<_> = (0..5)
        .filter_map(|w| today.checked_add_days(Days::new(w * 7)))
        .collect();
    vec![
        (
            "sim-primary".to_string(),
            Arc::new(SimulatedProvider::new(expiries.clone())) as Arc<dyn MarketProvider>,
        ),
        (
            "sim-secondary".to_string(),
            Arc::new(SimulatedProvider::new(expiries)) as Arc<dyn MarketProvider>,
        ),
    ]
}

async fn run(cfg: AppConfig) -> Result<()> {
    let ctx = AppContext::bootstrap(cfg, default_providers())?;

    if ctx.cfg.provider.validate_capabilities {
        let indices: Vec<String> = ctx.cfg.indices.iter().map(|i| i.symbol.clone()).collect();
        ctx.provider.validate_capabilities(&indices).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Signal handling: first signal requests a graceful stop; the current
    // cycle completes, SSE clients get a bye, then we exit.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("🛑 shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    let server = tokio::spawn(sse_server::serve(ctx.clone(), shutdown_rx.clone()));

    let mut executor = CycleExecutor::new(ctx.clone());
    let loop_result = executor.run(shutdown_rx).await;

    // Scheduler finished (run-once/max-cycles or signal): stop the server.
    let _ = shutdown_tx.send(true);
    if let Ok(Err(e)) = server.await {
        error!("http server error: {}", e);
    }
    loop_result
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("orchestrator failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}
