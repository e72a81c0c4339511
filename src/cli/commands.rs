//! CLI command implementations

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::args::Command;
use super::errors::{CliError, CliResult};
use crate::federation::{
    ConsumerCoordinator, FederationConfig, FederationError, LeadershipSignal, MirrorFactory,
    MirrorIngress, ProducerCoordinator, RemoteSiteConfig, StaticSiteRegistry, MIRROR_PLUGIN_TYPE,
};
use crate::observability::{Event, FederationMetrics, Logger, Severity};
use crate::store::{DataPath, DatastoreKind, MemoryStore};
use crate::transport::{BrokerEndpoint, InMemoryBus};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Main CLI entry point
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    Logger::set_threshold(if cli.verbose {
        Severity::Trace
    } else {
        Severity::Warn
    });
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Validate { config } => {
            let summary = validate(&config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Loopback { entities } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let report = runtime.block_on(loopback(entities))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Load a config file and describe what the federation would do with it
pub fn validate(config_path: &Path) -> CliResult<Value> {
    let config = FederationConfig::load(config_path)?;
    Logger::info(
        Event::ConfigLoaded,
        &[
            ("path", &config_path.display().to_string()),
            ("site_id", &config.site_id),
        ],
    );

    let sites: Vec<Value> = config
        .sites
        .iter()
        .map(|site| {
            json!({
                "site_id": site.site_id,
                "control_queue": site.control_queue(),
                "broker": site.broker.address(),
            })
        })
        .collect();

    Ok(json!({
        "site_id": config.site_id,
        "start_service": config.start_service,
        "broker": config.broker.address(),
        "control_queue": config.control_queue(),
        "control_queue_retry_secs": config.control_queue_retry_secs,
        "abort_timeout_secs": config.abort_timeout_secs,
        "remote_sites": sites,
    }))
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) -> CliResult<()> {
    let polled = tokio::time::timeout(CONVERGE_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    polled.map_err(|_| {
        CliError::timeout(format!(
            "{} did not happen within {:?}",
            what, CONVERGE_TIMEOUT
        ))
    })
}

fn site_config(local: &str, remote: &str, broker: &BrokerEndpoint) -> FederationConfig {
    FederationConfig::new(local, broker.clone()).with_site(RemoteSiteConfig {
        site_id: remote.to_string(),
        control_queue_name: None,
        broker: broker.clone(),
    })
}

/// Two sites on one in-process bus: site-a mirrors `/inventory` from site-b.
///
/// Returns both sites' counters, the mirror's counters and the number of
/// replicated entries.
pub async fn loopback(entities: usize) -> CliResult<Value> {
    let bus = Arc::new(InMemoryBus::new());
    let broker = BrokerEndpoint::new("loopback");
    let inventory = DataPath::new(DatastoreKind::Config, "/inventory");

    let config_a = site_config("site-a", "site-b", &broker);
    let config_b = site_config("site-b", "site-a", &broker);
    config_a.validate()?;
    config_b.validate()?;

    let metrics_a = Arc::new(FederationMetrics::new());
    let metrics_b = Arc::new(FederationMetrics::new());
    let store_a = MemoryStore::new();
    let store_b = MemoryStore::new();

    let consumer_a = ConsumerCoordinator::new(
        config_a.clone(),
        bus.clone(),
        Arc::new(StaticSiteRegistry::from_config(&config_a)),
        metrics_a.clone(),
    );
    let consumer_b = ConsumerCoordinator::new(
        config_b.clone(),
        bus.clone(),
        Arc::new(StaticSiteRegistry::from_config(&config_b)),
        metrics_b.clone(),
    );
    let producer_b = ProducerCoordinator::new(
        config_b,
        bus.clone(),
        Arc::new(store_b.clone()),
        Arc::new(consumer_b.clone()),
        metrics_b.clone(),
    );
    producer_b.attach_plugin_factory(
        MIRROR_PLUGIN_TYPE,
        Arc::new(MirrorFactory::new(vec![inventory.clone()])),
    )?;

    let leadership_a = LeadershipSignal::new();
    leadership_a.register(Arc::new(consumer_a.clone()));
    leadership_a.set_leader(true);

    let leadership_b = LeadershipSignal::new();
    leadership_b.register(Arc::new(producer_b.clone()));
    leadership_b.register(Arc::new(consumer_b.clone()));
    leadership_b.set_leader(true);
    wait_for("site-b control queue attach", || producer_b.has_control_handler()).await?;

    let snapshot: serde_json::Map<String, Value> = (0..entities)
        .map(|i| (format!("item-{}", i), json!({ "id": i, "rev": 1 })))
        .collect();
    store_b
        .put(&inventory, Value::Object(snapshot))
        .map_err(FederationError::from)?;

    let ingress = Arc::new(MirrorIngress::new(store_a.clone()));
    consumer_a
        .subscribe("site-b", None, ingress.clone(), false)
        .await?;
    wait_for("full sync", || ingress.stats().full_syncs_completed >= 1).await?;
    // Listeners are registered after EndFullSync is sent
    wait_for("session listeners", || {
        producer_b.session_listener_count("site-a") > 0
    })
    .await?;

    for i in 0..entities {
        store_b
            .put(
                &inventory.child(&format!("item-{}", i)),
                json!({ "id": i, "rev": 2 }),
            )
            .map_err(FederationError::from)?;
    }
    let expected = 1 + entities as u64;
    wait_for("steady sync", || ingress.stats().entities_applied >= expected).await?;

    consumer_a.unsubscribe("site-b").await?;
    wait_for("session teardown", || producer_b.session_count() == 0).await?;

    let replicated = store_a
        .entries_under(&inventory)
        .map_err(FederationError::from)?
        .len();

    producer_b.shutdown().await;
    consumer_b.shutdown().await;
    consumer_a.shutdown().await;

    Ok(json!({
        "site-a": metrics_a.snapshot(),
        "site-b": metrics_b.snapshot(),
        "mirror": ingress.stats(),
        "replicated_entries": replicated,
    }))
}
