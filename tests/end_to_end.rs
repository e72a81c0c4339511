//! End-to-End Federation Tests
//!
//! Two sites on one loopback bus, each with its own store. site-a mirrors
//! `/inventory` from site-b through the control queue, a producer session and
//! a consumer subscription.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use fedsync::federation::{
    ConsumerCoordinator, FederationConfig, LeadershipSignal, MirrorFactory, MirrorIngress,
    ProducerCoordinator, RemoteSiteConfig, StaticSiteRegistry, MIRROR_PLUGIN_TYPE,
};
use fedsync::observability::FederationMetrics;
use fedsync::store::{DataPath, DataStore, DatastoreKind, MemoryStore};
use fedsync::transport::{BrokerEndpoint, InMemoryBus};

struct Federation {
    bus: Arc<InMemoryBus>,
    store_a: MemoryStore,
    store_b: MemoryStore,
    consumer_a: ConsumerCoordinator,
    producer_b: ProducerCoordinator,
    consumer_b: ConsumerCoordinator,
}

fn inventory() -> DataPath {
    DataPath::new(DatastoreKind::Config, "/inventory")
}

fn config(local: &str, remote: &str) -> FederationConfig {
    FederationConfig::new(local, BrokerEndpoint::new("loopback")).with_site(RemoteSiteConfig {
        site_id: remote.into(),
        control_queue_name: None,
        broker: BrokerEndpoint::new("loopback"),
    })
}

fn consumer(config: FederationConfig, bus: Arc<InMemoryBus>) -> ConsumerCoordinator {
    let sites = Arc::new(StaticSiteRegistry::from_config(&config));
    ConsumerCoordinator::new(config, bus, sites, Arc::new(FederationMetrics::new()))
}

async fn federation() -> Federation {
    let bus = Arc::new(InMemoryBus::new());
    let store_a = MemoryStore::new();
    let store_b = MemoryStore::new();

    let consumer_a = consumer(config("site-a", "site-b"), bus.clone());
    let consumer_b = consumer(config("site-b", "site-a"), bus.clone());
    let producer_b = ProducerCoordinator::new(
        config("site-b", "site-a"),
        bus.clone(),
        Arc::new(store_b.clone()),
        Arc::new(consumer_b.clone()),
        Arc::new(FederationMetrics::new()),
    );
    producer_b
        .attach_plugin_factory(
            MIRROR_PLUGIN_TYPE,
            Arc::new(MirrorFactory::new(vec![inventory()])),
        )
        .unwrap();

    let leadership_a = LeadershipSignal::new();
    leadership_a.register(Arc::new(consumer_a.clone()));
    leadership_a.set_leader(true);

    let leadership_b = LeadershipSignal::new();
    leadership_b.register(Arc::new(producer_b.clone()));
    leadership_b.register(Arc::new(consumer_b.clone()));
    leadership_b.set_leader(true);
    assert!(producer_b.has_control_handler());

    Federation {
        bus,
        store_a,
        store_b,
        consumer_a,
        producer_b,
        consumer_b,
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{} not reached", what);
}

fn read(store: &MemoryStore, path: &DataPath) -> Option<Value> {
    store.read(path).unwrap()
}

// =============================================================================
// Replication
// =============================================================================

/// Existing data arrives by full sync, later writes and deletes by steady sync.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mirror_full_and_steady_sync() {
    let fed = federation().await;
    fed.store_b
        .put(&inventory(), json!({"item-0": {"qty": 1}}))
        .unwrap();

    let ingress = Arc::new(MirrorIngress::new(fed.store_a.clone()));
    fed.consumer_a
        .subscribe("site-b", None, ingress.clone(), false)
        .await
        .unwrap();
    wait_until("full sync", || ingress.stats().full_syncs_completed == 1).await;
    assert_eq!(
        read(&fed.store_a, &inventory()),
        Some(json!({"item-0": {"qty": 1}}))
    );

    let item = inventory().child("item-1");
    fed.store_b.put(&item, json!({"qty": 7})).unwrap();
    wait_until("steady write", || read(&fed.store_a, &item).is_some()).await;
    assert_eq!(read(&fed.store_a, &item), Some(json!({"qty": 7})));

    assert!(fed.store_b.delete(&item).unwrap());
    wait_until("steady delete", || read(&fed.store_a, &item).is_none()).await;

    let stats = ingress.stats();
    assert_eq!(stats.full_syncs_started, 1);
    assert_eq!(stats.entities_applied, 3);
    assert_eq!(stats.resubscribe_requests, 0);
    assert_eq!(fed.consumer_a.metrics().snapshot().sequence_mismatch, 0);
}

/// Unsubscribing from the consumer side closes the producer session.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_closes_remote_session() {
    let fed = federation().await;
    let ingress = Arc::new(MirrorIngress::new(fed.store_a.clone()));
    let queue = fed
        .consumer_a
        .subscribe("site-b", None, ingress.clone(), false)
        .await
        .unwrap();
    wait_until("session", || fed.store_b.listener_count() == 1).await;
    assert_eq!(fed.producer_b.session_queue("site-a"), Some(queue.clone()));

    fed.consumer_a.unsubscribe("site-b").await.unwrap();
    wait_until("teardown", || fed.store_b.listener_count() == 0).await;

    assert_eq!(fed.producer_b.session_count(), 0);
    assert!(!fed.bus.queue_exists(&queue));

    fed.store_b.put(&inventory().child("late"), json!(1)).unwrap();
    assert_eq!(read(&fed.store_a, &inventory().child("late")), None);
}

/// A second subscribe replaces the producer session and restarts full sync.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resubscribe_restarts_full_sync() {
    let fed = federation().await;
    fed.store_b.put(&inventory(), json!({"v": 1})).unwrap();

    let ingress = Arc::new(MirrorIngress::new(fed.store_a.clone()));
    let first = fed
        .consumer_a
        .subscribe("site-b", None, ingress.clone(), false)
        .await
        .unwrap();
    wait_until("first full sync", || ingress.stats().full_syncs_completed == 1).await;

    let second = fed
        .consumer_a
        .subscribe("site-b", None, ingress.clone(), false)
        .await
        .unwrap();
    wait_until("second full sync", || ingress.stats().full_syncs_completed == 2).await;
    wait_until("session replaced", || {
        fed.producer_b.session_queue("site-a").as_deref() == Some(second.as_str())
    })
    .await;

    wait_until("listener re-registered", || fed.store_b.listener_count() == 1).await;

    assert_ne!(first, second);
    assert_eq!(fed.producer_b.session_count(), 1);

    fed.store_b.put(&inventory().child("x"), json!(2)).unwrap();
    wait_until("steady after resubscribe", || {
        read(&fed.store_a, &inventory().child("x")).is_some()
    })
    .await;
    assert_eq!(ingress.stats().resubscribe_requests, 0);
}

/// Shutdown on both sides leaves no queues, sessions or listeners.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_both_sites() {
    let fed = federation().await;
    let ingress = Arc::new(MirrorIngress::new(fed.store_a.clone()));
    let queue = fed
        .consumer_a
        .subscribe("site-b", None, ingress, false)
        .await
        .unwrap();
    wait_until("session", || fed.store_b.listener_count() == 1).await;

    fed.consumer_a.shutdown().await;
    wait_until("teardown", || fed.producer_b.session_count() == 0).await;
    fed.producer_b.shutdown().await;
    fed.consumer_b.shutdown().await;

    assert!(!fed.bus.queue_exists(&queue));
    assert!(!fed.bus.queue_exists("site-b_FederationControlQueue"));
    assert_eq!(fed.store_b.listener_count(), 0);
    assert_eq!(fed.consumer_a.subscription_count(), 0);
}
