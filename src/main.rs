//! Trading Aggregator
//! Mission: one broker between every order producer and the Connection
//! Manager - risk-gated, prioritized, rate-limited, observable.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trading_aggregator::{
    aggregator::{wire_bus, Aggregator},
    api::{self, ApiState},
    bus::{BusAdapter, BusTransport, WsTransport},
    config::AppConfig,
    downstream::ConnectionManagerClient,
    metrics::MetricsHub,
};

/// Startup failure: bad config, bus unreachable.
const EXIT_STARTUP_FAILURE: i32 = 1;
/// Unrecoverable runtime loss (bus gone past the retry budget).
const EXIT_FATAL_RUNTIME: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "aggregator", about = "Trading aggregator runtime")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "AGGREGATOR_CONFIG")]
    config: Option<PathBuf>,
    /// Force risk shadow mode on, regardless of configuration.
    #[arg(long)]
    shadow: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };
    if args.shadow {
        config.risk.shadow_mode = true;
    }

    info!("🚀 Trading Aggregator starting");
    info!(
        bus = %config.bus.url(),
        monitor_port = config.monitoring.port,
        shadow = config.risk.shadow_mode,
        "configuration loaded"
    );

    // Bus first: a dead broker is a startup failure.
    let transport = match WsTransport::connect(config.bus.clone()).await {
        Ok(transport) => transport,
        Err(e) => {
            error!(error = %e, url = %config.bus.url(), "bus unreachable");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };
    let mut bus_fatal = transport.fatal_signal();

    let transport: Arc<dyn BusTransport> = transport;
    let bus = BusAdapter::new(transport, "aggregator", config.bus.clone());
    bus.run();

    let downstream = Arc::new(ConnectionManagerClient::new(
        Arc::clone(&bus),
        config.downstream.clone(),
    ));
    let metrics = Arc::new(MetricsHub::new(config.monitoring.history_size));

    let handle = Aggregator::spawn(
        config.clone(),
        Arc::clone(&bus),
        downstream,
        Arc::clone(&metrics),
    );
    if let Err(e) = wire_bus(handle.clone(), Arc::clone(&bus)).await {
        error!(error = %e, "bus subscription wiring failed");
        std::process::exit(EXIT_STARTUP_FAILURE);
    }

    // Monitoring surface.
    let api_state = ApiState {
        metrics: Arc::clone(&metrics),
        config: config.monitoring.clone(),
        queue_capacity: config.queue.max_queue_size,
    };
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_state).await {
            error!(error = %e, "monitoring surface exited");
        }
    });

    // 1 Hz history sampler with the process memory gauge.
    tokio::spawn(history_sampler(Arc::clone(&metrics)));

    info!("✅ aggregator online");

    // Run until SIGINT (drain) or fatal bus loss (exit 2).
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🔻 SIGINT received; draining");
            tokio::select! {
                _ = handle.shutdown(false) => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("second SIGINT; forcing shutdown");
                    handle.shutdown(true).await;
                }
            }
        }
        _ = bus_fatal.changed() => {
            if *bus_fatal.borrow() {
                error!("🛑 bus lost past the retry budget");
                handle.shutdown(true).await;
                std::process::exit(EXIT_FATAL_RUNTIME);
            }
        }
    }

    info!("👋 clean shutdown");
    Ok(())
}

/// Initialize tracing with enhanced observability.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trading_aggregator=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Append a history row every second, refreshing the memory gauge first.
async fn history_sampler(metrics: Arc<MetricsHub>) {
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        metrics.set_memory_mb(process_resident_mb());
        metrics.sample_history();
    }
}

/// Resident memory of this process in megabytes. Uses a cached System
/// instance - creating one is expensive.
fn process_resident_mb() -> f64 {
    use parking_lot::Mutex;
    use std::sync::OnceLock;
    use sysinfo::{Pid, ProcessRefreshKind, System};

    static CACHED_SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();
    let sys_mutex = CACHED_SYSTEM.get_or_init(|| Mutex::new(System::new()));
    let mut sys = sys_mutex.lock();

    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );
    sys.process(pid)
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}
