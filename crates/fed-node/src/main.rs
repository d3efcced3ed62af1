//! Federation control plane binary.
//!
//! Wires the Registry, Router, and Health Monitor together and runs the
//! Health Monitor tick loop, the affinity-expiry sweep, and the Router's
//! unregister-event listener. Deliberately thin: no HTTP API, no CLI
//! beyond startup flags.

use clap::Parser;
use fed_config::FederationConfig;
use fed_health::{HealthMonitor, ReqwestHealthProbe};
use fed_observe::{EventBus, MetricsExporter, OperationsMetrics};
use fed_registry::Registry;
use fed_router::Router;
use fed_store::{InstanceStore, JsonInstanceStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "fed-node", about = "Federation control plane")]
struct Cli {
    /// Directory for persisted instance records and config.
    #[arg(long, default_value = "/var/lib/fedctl")]
    state_path: PathBuf,

    /// Print the Prometheus metrics snapshot once at startup and exit.
    #[arg(long)]
    print_metrics_once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let config_path = cli.state_path.join("config.json");
    let config = FederationConfig::load(&config_path).unwrap_or_else(|_| {
        tracing::info!("no config found at {}, using defaults", config_path.display());
        FederationConfig::default()
    });

    let store: Arc<dyn InstanceStore> = Arc::new(JsonInstanceStore::new(&cli.state_path));
    let metrics = Arc::new(OperationsMetrics::new());
    let events = Arc::new(EventBus::default().with_metrics(Arc::clone(&metrics)));

    let registry = Arc::new(Registry::new(store, events.clone(), metrics.clone()).await?);
    let router = Arc::new(Router::new(Arc::clone(&registry), events.clone(), config.clone()));
    let health_monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        events.clone(),
        metrics.clone(),
        config.clone(),
        Arc::new(ReqwestHealthProbe::new()),
    ));

    if cli.print_metrics_once {
        let exporter = MetricsExporter::new(metrics);
        print!("{}", exporter.render());
        return Ok(());
    }

    health_monitor.start();

    tokio::spawn(Arc::clone(&router).run_affinity_event_listener(events.subscribe()));

    let sweep_interval = Duration::from_secs(config.affinity_ttl_secs.max(1));
    let sweep_router = Arc::clone(&router);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweep_router.sweep_expired_affinities();
        }
    });

    tracing::info!("federation control plane started");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    health_monitor.stop();

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("fed_node=info".parse().expect("valid directive")))
        .init();
}
