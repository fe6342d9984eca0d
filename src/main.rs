use clap::Parser;
use perpbot::api::{GateIoClient, PaperAccount};
use perpbot::config::Settings;
use perpbot::market::{SeriesCache, SymbolCatalog};
use perpbot::persistence::{MemorySnapshotStore, RedisSnapshotStore, SnapshotStore};
use perpbot::{Engine, Result, Shutdown};
use std::sync::Arc;
use std::time::Duration;

/// How long loops get to finish their current iteration after Ctrl+C
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "Mean-reversion DCA bot for perpetual futures")]
struct Cli {
    /// Config file (TOML); missing file falls back to defaults
    #[arg(long, default_value = "perpbot.toml")]
    config: String,

    /// tracing filter, overrides the config file and RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,

    /// Run one slow scan and one fast scan, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::load(Some(cli.config.as_str()))?;
    setup_logging(cli.log_filter.as_deref(), &settings.logging.filter);

    tracing::info!("🚀 perpbot starting");
    print_configuration(&settings);

    // ========================================================================
    // Wiring
    // ========================================================================

    let market = Arc::new(GateIoClient::new(&settings.exchange)?);
    let cache = SeriesCache::new(settings.series.max_candles);
    let catalog = SymbolCatalog::new();
    let account = Arc::new(PaperAccount::new(
        settings.paper.starting_equity,
        cache.clone(),
        catalog.clone(),
    ));
    let store = connect_store(settings.persistence.redis_url.as_deref()).await;

    let engine = Arc::new(Engine::new(
        settings,
        market,
        account,
        store,
        cache,
        catalog,
    ));

    engine.startup().await?;

    if cli.once {
        let report = engine.run_once().await?;
        tracing::info!(
            "✅ Single pass done: {} watched, {} evaluated, {} actions",
            report.slow.watchlist.len(),
            report.fast.evaluated,
            report.fast.actions.len()
        );
        engine.flush().await;
        return Ok(());
    }

    // ========================================================================
    // Loops
    // ========================================================================

    let shutdown = Shutdown::new();
    let mut engine_task = tokio::spawn(engine.clone().run(shutdown.clone()));

    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = &mut engine_task => {
            tracing::error!("Engine exited unexpectedly: {:?}", result);
            return Ok(());
        }
    }

    shutdown.trigger();
    match tokio::time::timeout(DRAIN_TIMEOUT, engine_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Engine task failed: {}", e),
        Err(_) => tracing::warn!("Loops did not stop within {:?}", DRAIN_TIMEOUT),
    }

    tracing::info!("👋 perpbot stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

/// CLI flag wins, then RUST_LOG, then the configured filter
fn setup_logging(cli_filter: Option<&str>, configured: &str) {
    let filter = cli_filter
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| configured.to_string());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_store(redis_url: Option<&str>) -> Arc<dyn SnapshotStore> {
    let Some(url) = redis_url else {
        tracing::info!("No Redis configured, DCA snapshot kept in memory only");
        return Arc::new(MemorySnapshotStore::new());
    };

    match RedisSnapshotStore::new(url).await {
        Ok(store) => {
            tracing::info!("Redis persistence enabled at {}", url);
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Redis ({}), continuing with in-memory snapshot",
                e
            );
            Arc::new(MemorySnapshotStore::new())
        }
    }
}

fn print_configuration(settings: &Settings) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Exchange: {} ({})", settings.exchange.base_url, settings.exchange.settle);
    tracing::info!("  Paper equity: ${:.2}", settings.paper.starting_equity);
    tracing::info!(
        "  Leverage: {}x | entry {:.1}% (strong {:.1}%) | symbol limit {}",
        settings.execution.leverage,
        settings.execution.entry_percent * 100.0,
        settings.execution.strong_entry_percent * 100.0,
        settings.execution.symbol_limit
    );
    tracing::info!(
        "  DCA: max {} | gaps {:?} | multiplier {}",
        settings.strategy.max_dca,
        settings.strategy.dca_gaps,
        settings.strategy.dca_multiplier
    );
    tracing::info!(
        "  Scans: slow {}s | fast {}s | cap {} ({:?})",
        settings.scan.slow_interval_secs,
        settings.scan.fast_interval_secs,
        settings.scan.fast_cap,
        settings.scan.overflow_policy
    );
}
