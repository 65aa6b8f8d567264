//! AIRWARDEN - Urban Air Quality Intelligence
//!
//! Continuous air quality monitoring core: normalizes station readings,
//! deduplicates, aggregates hourly, and raises threshold/anomaly alerts.
//!
//! # Usage
//!
//! ```bash
//! # Run with continuous synthetic city readings
//! cargo run --release
//!
//! # Run with simulator input from stdin
//! cargo run --release --bin simulate | ./airwarden --stdin
//!
//! # Replay a historical readings CSV at 60x speed
//! ./airwarden --csv readings.csv --speed 60
//! ```
//!
//! # Environment Variables
//!
//! - `AIRWARDEN_CONFIG`: Path to a monitor_config.toml override
//! - `AIRWARDEN_ADDR`: HTTP server bind address (default: 0.0.0.0:8080)
//! - `AIRWARDEN_STORE`: Storage backend, `sled` or `memory`
//! - `AIRWARDEN_CORS_ORIGINS`: Comma-separated allowed CORS origins
//! - `RUST_LOG`: Logging level (default: info)
//! - `RESET_DB`: Set to "true" to wipe all persistent data on startup (for testing)

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use airwarden::aggregate::{run_aggregator, HourlyAggregator};
use airwarden::alerts::{run_alert_sink, AlertSink};
use airwarden::api::{create_app, ApiState};
use airwarden::aqi::AqiScale;
use airwarden::config::{
    self, run_registry_refresh, seeded_cities, CityRegistry, MonitorConfig, RegistryHandle,
};
use airwarden::detector::{run_detector, Detector};
use airwarden::ingest::{run_eviction_sweep, IngestBuffer};
use airwarden::pipeline::{
    CsvSource, PipelineStats, ProcessingLoop, ReadingSource, StdinSource, SyntheticSource,
};
use airwarden::store::{
    run_retry_drain, MemoryStore, RetryPolicy, RetryQueue, SledStore, StoreAdapter,
};
use airwarden::types::{HourlyAggregate, Measurement, SinkEvent};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "airwarden")]
#[command(about = "AIRWARDEN Urban Air Quality Monitoring Core")]
#[command(version)]
struct CliArgs {
    /// Read raw readings from stdin (JSON lines) instead of synthetic data
    /// Use with the simulator: ./simulate | ./airwarden --stdin
    #[arg(long)]
    stdin: bool,

    /// Path to CSV file with historical readings to replay
    #[arg(long)]
    csv: Option<String>,

    /// Speed multiplier for replay/synthetic modes (1 = realtime, 60 = 60x faster, 0 = no delay)
    #[arg(long, default_value = "1")]
    speed: u64,

    /// Override the server address (default: "0.0.0.0:8080")
    #[arg(short, long, env = "AIRWARDEN_ADDR")]
    addr: Option<String>,

    /// Storage backend: "sled" (persistent) or "memory" (volatile, for tests)
    #[arg(long, default_value = "sled", env = "AIRWARDEN_STORE")]
    store: String,

    /// RNG seed for the synthetic source (reproducible runs)
    #[arg(long)]
    seed: Option<u64>,

    /// Reset all persistent data (measurements, aggregates, alerts) on startup.
    /// WARNING: This is destructive and cannot be undone!
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,
}

// ============================================================================
// Database Reset
// ============================================================================

/// Check if database reset is requested via CLI flag or environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

/// Safely remove the data directory and all its contents.
fn reset_data_directory(data_dir: &str) -> Result<()> {
    use std::fs;
    use std::path::Path;

    let data_path = Path::new(data_dir);

    if !data_path.exists() {
        info!("Data directory does not exist, nothing to reset");
        return Ok(());
    }

    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("  RESET_DB DETECTED - WIPING ALL PERSISTENT DATA");
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("");
    warn!("  Removing: {}", data_path.display());

    if let Ok(entries) = fs::read_dir(data_path) {
        for entry in entries.flatten() {
            let path = entry.path();
            let file_type = if path.is_dir() { "DIR " } else { "FILE" };
            warn!("    {} {}", file_type, path.display());
        }
    }

    fs::remove_dir_all(data_path).context("Failed to remove data directory")?;

    warn!("");
    warn!("  Data directory removed successfully.");
    warn!("  A fresh database will be created on startup.");
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("");

    Ok(())
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    ReadingProcessor,
    Aggregator,
    Detector,
    AlertSink,
    RegistryRefresh,
    DedupSweep,
    RetryDrain,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::ReadingProcessor => write!(f, "ReadingProcessor"),
            TaskName::Aggregator => write!(f, "Aggregator"),
            TaskName::Detector => write!(f, "Detector"),
            TaskName::AlertSink => write!(f, "AlertSink"),
            TaskName::RegistryRefresh => write!(f, "RegistryRefresh"),
            TaskName::DedupSweep => write!(f, "DedupSweep"),
            TaskName::RetryDrain => write!(f, "RetryDrain"),
        }
    }
}

// ============================================================================
// Shared Pipeline Initialization
// ============================================================================

/// Common pipeline infrastructure shared between all input modes.
struct PipelineCore {
    store: Arc<dyn StoreAdapter>,
    registry: RegistryHandle,
    retry_queue: Arc<RetryQueue>,
    retry_policy: RetryPolicy,
    stats: Arc<RwLock<PipelineStats>>,
    buffer: Arc<IngestBuffer>,
    aggregator_rx: mpsc::Receiver<Measurement>,
    detector_rx: mpsc::Receiver<Measurement>,
    listener: tokio::net::TcpListener,
    app: Router,
}

/// Build the storage backend selected on the command line.
fn build_store(backend: &str, data_dir: &str) -> Result<Arc<dyn StoreAdapter>> {
    match backend {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "sled" => {
            let path = std::path::Path::new(data_dir).join("airwarden.sled");
            let store = SledStore::open(&path)
                .with_context(|| format!("Failed to open sled store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        other => Err(anyhow::anyhow!(
            "Unknown store backend '{}' (expected 'sled' or 'memory')",
            other
        )),
    }
}

/// Load city configurations from the store, seeding the built-in defaults
/// on first run, and wrap them in a refreshable registry handle.
async fn seed_registry(store: &Arc<dyn StoreAdapter>) -> Result<RegistryHandle> {
    let mut cities = store
        .list_city_configs()
        .await
        .context("Failed to load city configurations from store")?;

    if cities.is_empty() {
        info!("📝 Store has no city configurations, seeding defaults");
        cities = seeded_cities();
        for city in &cities {
            store
                .upsert_city_config(city)
                .await
                .with_context(|| format!("Failed to seed city configuration for {}", city.city))?;
        }
        info!("✓ Seeded {} default city configurations", cities.len());
    } else {
        info!("✓ Loaded {} city configurations from store", cities.len());
    }

    Ok(RegistryHandle::new(CityRegistry::from_cities(cities)))
}

/// Initialize the shared pipeline: store, registry, retry queue, ingest
/// buffer, API state, and HTTP listener.
async fn init_pipeline(store_backend: &str, server_addr: &str) -> Result<PipelineCore> {
    let cfg = config::get();

    let store = build_store(store_backend, &cfg.store.data_dir)?;
    info!("💾 Store backend: {}", store.backend_name());

    let registry = seed_registry(&store).await?;

    let retry_queue = Arc::new(RetryQueue::new(cfg.store.retry_queue_capacity));
    let retry_policy = RetryPolicy::from_config(&cfg.store);
    let stats = Arc::new(RwLock::new(PipelineStats::default()));

    let (buffer, aggregator_rx, detector_rx) = IngestBuffer::new(
        cfg.ingest.shard_count,
        cfg.ingest.dedup_window_hours,
        cfg.ingest.channel_capacity,
    );
    let buffer = Arc::new(buffer);
    info!(
        "✓ Ingest buffer ready ({} shards, {}h dedup window)",
        cfg.ingest.shard_count, cfg.ingest.dedup_window_hours
    );

    info!("🌐 Starting HTTP server on {}...", server_addr);
    let api_state = ApiState::new(Arc::clone(&store), registry.clone(), Arc::clone(&stats));
    let app = create_app(api_state);

    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", server_addr))?;

    info!("✓ HTTP server listening on {}", server_addr);
    info!("");
    info!("🎯 Operational API available at: http://{}", server_addr);
    info!("");

    Ok(PipelineCore {
        store,
        registry,
        retry_queue,
        retry_policy,
        stats,
        buffer,
        aggregator_rx,
        detector_rx,
        listener,
        app,
    })
}

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("🔒 Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Unified Pipeline Runner
// ============================================================================

/// Run the monitoring pipeline with any reading source.
///
/// All input modes (synthetic, CSV replay, stdin) flow through this
/// function. Each stage runs as its own supervised task, connected by
/// bounded channels.
async fn run_pipeline<S: ReadingSource>(
    mut source: S,
    store_backend: &str,
    server_addr: String,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🚀 Starting AIRWARDEN Air Quality Pipeline");
    info!("");
    info!("   Stage 1: Reading Normalization (field checks, AQI derivation)");
    info!("   Stage 2: Deduplicating Ingest Buffer");
    info!("   Stage 3: Hourly Aggregation (per-city UTC windows)");
    info!("   Stage 4: Detection (thresholds + sigma baselines)");
    info!("   Stage 5: Alert Sink (dedup, persistence)");
    info!("   Stage 6: Operational API");
    info!("");

    let cfg = config::get();
    let core = init_pipeline(store_backend, &server_addr).await?;

    // Inter-stage channels: flushed aggregate rows feed aggregate-level
    // detection; detector events feed the alert sink.
    let (flush_tx, flush_rx) = mpsc::channel::<HourlyAggregate>(cfg.ingest.channel_capacity);
    let (events_tx, events_rx) = mpsc::channel::<SinkEvent>(cfg.ingest.channel_capacity);

    info!("🔒 Supervisor: Initializing task monitoring");
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: HTTP Server
    spawn_http_server(&mut task_set, core.listener, core.app, cancel_token.clone());

    // Task 2: Hourly Aggregator
    let aggregator = HourlyAggregator::new(
        Arc::clone(&core.store),
        Arc::clone(&core.retry_queue),
        core.retry_policy,
        &cfg.aggregation,
        Some(flush_tx),
    );
    let agg_rx = core.aggregator_rx;
    let agg_sweep = cfg.aggregation.flush_sweep_secs;
    let agg_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[Aggregator] Task starting");
        run_aggregator(aggregator, agg_rx, agg_sweep, agg_cancel).await;
        Ok(TaskName::Aggregator)
    });

    // Task 3: Detector
    let detector = Detector::new(
        core.registry.clone(),
        Arc::clone(&core.store),
        &cfg.detection,
    );
    let det_rx = core.detector_rx;
    let det_refresh = cfg.detection.baseline_refresh_secs;
    let det_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[Detector] Task starting");
        run_detector(detector, det_rx, flush_rx, events_tx, det_refresh, det_cancel).await;
        Ok(TaskName::Detector)
    });

    // Task 4: Alert Sink
    let sink = AlertSink::new(
        Arc::clone(&core.store),
        Arc::clone(&core.retry_queue),
        core.retry_policy,
    );
    let sink_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[AlertSink] Task starting");
        run_alert_sink(sink, events_rx, sink_cancel).await;
        Ok(TaskName::AlertSink)
    });

    // Task 5: Registry Refresh
    let refresh_handle = core.registry.clone();
    let refresh_store = Arc::clone(&core.store);
    let refresh_secs = cfg.registry.refresh_secs;
    let refresh_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[RegistryRefresh] Task starting");
        run_registry_refresh(refresh_handle, refresh_store, refresh_secs, refresh_cancel).await;
        Ok(TaskName::RegistryRefresh)
    });

    // Task 6: Dedup Eviction Sweep
    let sweep_buffer = Arc::clone(&core.buffer);
    let sweep_secs = cfg.ingest.eviction_sweep_secs;
    let sweep_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[DedupSweep] Task starting");
        run_eviction_sweep(sweep_buffer, sweep_secs, sweep_cancel).await;
        Ok(TaskName::DedupSweep)
    });

    // Task 7: Retry Queue Drain
    let drain_queue = Arc::clone(&core.retry_queue);
    let drain_store = Arc::clone(&core.store);
    let drain_secs = cfg.store.retry_drain_secs;
    let drain_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[RetryDrain] Task starting");
        run_retry_drain(drain_queue, drain_store, drain_secs, drain_cancel).await;
        Ok(TaskName::RetryDrain)
    });

    // Task 8: Reading Processor (normalize + ingest loop)
    let proc_cancel = cancel_token.clone();
    let processing_loop = ProcessingLoop::new(
        core.registry.clone(),
        AqiScale::epa_defaults(),
        Arc::clone(&core.buffer),
        Arc::clone(&core.store),
        Arc::clone(&core.stats),
        proc_cancel,
    );
    task_set.spawn(async move {
        info!("[ReadingProcessor] Task starting");
        let _stats: PipelineStats = processing_loop.run(&mut source).await;
        Ok(TaskName::ReadingProcessor)
    });

    run_supervisor(&mut task_set, cancel_token).await
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    // Load monitor configuration (validated at load time)
    let monitor_config = MonitorConfig::load();

    // Reset DB check runs BEFORE any storage initialization
    if should_reset_db(args.reset_db) {
        reset_data_directory(&monitor_config.store.data_dir)?;
    }

    let server_addr = args
        .addr
        .clone()
        .unwrap_or_else(|| monitor_config.server.addr.clone());
    config::init(monitor_config);

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  AIRWARDEN - Urban Air Quality Intelligence");
    info!("  Continuous Monitoring Core");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("");

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let delay_ms = if args.speed == 0 {
        0
    } else {
        config::defaults::SIMULATION_BASE_DELAY_MS / args.speed
    };

    // Dispatch to the unified pipeline with the appropriate source
    if args.stdin {
        // --- Stdin mode ---
        info!("📥 Input: stdin (JSON readings from simulator)");
        run_pipeline(StdinSource::new(), &args.store, server_addr, cancel_token).await?;
    } else if let Some(path) = args.csv {
        // --- CSV replay mode ---
        info!("📂 Loading readings from CSV: {}", path);
        let source = CsvSource::from_path(&path, delay_ms)?;
        if source.is_empty() {
            return Err(anyhow::anyhow!("No readings loaded from CSV"));
        }
        info!(
            "⏱️  Speed: {}x ({}ms delay between readings)",
            if args.speed == 0 {
                "max".to_string()
            } else {
                args.speed.to_string()
            },
            delay_ms
        );
        info!("📊 {} readings queued for processing", source.len());
        run_pipeline(source, &args.store, server_addr, cancel_token).await?;
    } else {
        // --- Synthetic mode ---
        info!("🧪 Input: synthetic city readings (continuous simulation)");
        info!(
            "⏱️  Speed: {}x ({}ms between readings)",
            if args.speed == 0 {
                "max".to_string()
            } else {
                args.speed.to_string()
            },
            delay_ms
        );
        let source = SyntheticSource::new(delay_ms, args.seed)?;
        run_pipeline(source, &args.store, server_addr, cancel_token).await?;
    }

    info!("");
    info!("✓ AIRWARDEN shutdown complete");
    Ok(())
}
