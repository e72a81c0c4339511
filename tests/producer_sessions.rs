//! Producer Session Tests
//!
//! Producer coordinator behaviour against the loopback bus and memory store:
//! - Per-session sequence numbering across full sync and steady changes
//! - Session replacement, unsubscribe and shutdown teardown
//! - Full-sync failure, unknown plugin types and factory failures
//! - Plugin abort deadlines
//! - Control queue ownership under leadership, including broker retry

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use fedsync::federation::{
    control_queue_name, AbortAck, ConsumerManagement, EgressPlugin, EntityMessage, Envelope,
    FederationConfig, FederationError, FederationResult, LeadershipListener, ListenerData,
    MirrorFactory, PluginFactory, ProducerCoordinator, SessionPublisher, SubscribeMessage,
    UnsubscribeMessage, MIRROR_PLUGIN_TYPE,
};
use fedsync::observability::FederationMetrics;
use fedsync::store::{DataChange, DataPath, DatastoreKind, MemoryStore, ModificationKind};
use fedsync::transport::{BrokerEndpoint, InMemoryBus, MessageBus};

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Default)]
struct RecordingConsumers(Mutex<Vec<String>>);

impl RecordingConsumers {
    fn triggered(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl ConsumerManagement for RecordingConsumers {
    fn trigger_plugin_resubscription(&self, remote_id: &str) -> FederationResult<()> {
        self.0.lock().unwrap().push(remote_id.to_string());
        Ok(())
    }
}

struct Harness {
    bus: Arc<InMemoryBus>,
    store: MemoryStore,
    consumers: Arc<RecordingConsumers>,
    producer: ProducerCoordinator,
}

fn inventory() -> DataPath {
    DataPath::new(DatastoreKind::Config, "/inventory")
}

fn harness_with(config: FederationConfig) -> Harness {
    let bus = Arc::new(InMemoryBus::new());
    let store = MemoryStore::new();
    let consumers = Arc::new(RecordingConsumers::default());
    let producer = ProducerCoordinator::new(
        config,
        bus.clone(),
        Arc::new(store.clone()),
        consumers.clone(),
        Arc::new(FederationMetrics::new()),
    );
    producer
        .attach_plugin_factory(
            MIRROR_PLUGIN_TYPE,
            Arc::new(MirrorFactory::new(vec![inventory()])),
        )
        .unwrap();
    Harness {
        bus,
        store,
        consumers,
        producer,
    }
}

fn harness() -> Harness {
    harness_with(FederationConfig::new(
        "site-b",
        BrokerEndpoint::new("localhost"),
    ))
}

fn subscribe(context_id: &str, queue: &str) -> SubscribeMessage {
    SubscribeMessage {
        dynamic_queue_name: queue.to_string(),
        plugin_type: MIRROR_PLUGIN_TYPE.to_string(),
        payload: None,
        subscriber_id: context_id.to_string(),
        context_id: context_id.to_string(),
        request_mutual_subscription: false,
    }
}

fn sequence_ids(bus: &InMemoryBus, queue: &str) -> Vec<u64> {
    bus.sent_log(queue)
        .iter()
        .filter_map(Envelope::sequence_id)
        .collect()
}

fn kinds(bus: &InMemoryBus, queue: &str) -> Vec<&'static str> {
    bus.sent_log(queue).iter().map(Envelope::kind).collect()
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// =============================================================================
// Sequencing
// =============================================================================

/// Full sync of existing data is numbered 0, 1, .. with End last.
#[tokio::test]
async fn test_full_sync_is_numbered() {
    let h = harness();
    h.store.put(&inventory(), json!({"sku": 1})).unwrap();

    h.producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-1"))
        .await
        .unwrap();

    assert_eq!(
        kinds(&h.bus, "dyn-1"),
        vec!["StartFullSync", "EntityUpdate", "EndFullSync"]
    );
    assert_eq!(sequence_ids(&h.bus, "dyn-1"), vec![0, 1, 2]);
    assert_eq!(h.producer.session_count(), 1);
    assert_eq!(h.producer.session_listener_count("site-a"), 1);

    let counters = h.producer.metrics().snapshot();
    assert_eq!(counters.start_full_sync_msg_sent, 1);
    assert_eq!(counters.end_full_sync_msg_sent, 1);
    assert_eq!(counters.msg_published, 1);
}

/// Steady changes continue the session numbering without gaps.
#[tokio::test]
async fn test_steady_changes_continue_sequence() {
    let h = harness();

    h.producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-1"))
        .await
        .unwrap();
    for i in 0..4 {
        h.store
            .put(&inventory().child(&format!("item-{}", i)), json!(i))
            .unwrap();
    }

    assert_eq!(sequence_ids(&h.bus, "dyn-1"), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(h.producer.metrics().snapshot().dcn, 4);
}

/// Two sessions number independently.
#[tokio::test]
async fn test_sessions_number_independently() {
    let h = harness();

    h.producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-a"))
        .await
        .unwrap();
    h.producer
        .handle_subscribe_msg(subscribe("site-c", "dyn-c"))
        .await
        .unwrap();
    h.store.put(&inventory().child("x"), json!(1)).unwrap();

    assert_eq!(sequence_ids(&h.bus, "dyn-a"), vec![0, 1, 2]);
    assert_eq!(sequence_ids(&h.bus, "dyn-c"), vec![0, 1, 2]);
}

/// Publishing for a context with no session fails.
#[tokio::test]
async fn test_publish_without_session() {
    let h = harness();
    let entity =
        EntityMessage::encode(DatastoreKind::Config, ModificationKind::Write, &1).unwrap();

    assert!(matches!(
        h.producer.publish_message(entity, "dyn-1", "nobody"),
        Err(FederationError::SessionNotFound(_))
    ));
    assert!(h.bus.sent_log("dyn-1").is_empty());
}

// =============================================================================
// Session lifecycle
// =============================================================================

/// Unsubscribe tears down once; the second call is a no-op.
#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let h = harness();
    h.producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-1"))
        .await
        .unwrap();
    assert_eq!(h.store.listener_count(), 1);

    assert!(h.producer.unsubscribe_consumer("site-a").await);
    assert!(!h.producer.unsubscribe_consumer("site-a").await);

    assert_eq!(h.producer.session_count(), 0);
    assert_eq!(h.store.listener_count(), 0);
    assert_eq!(h.bus.destroyed_queues(), vec!["dyn-1".to_string()]);
}

/// Unsubscribe messages report an unknown context.
#[tokio::test]
async fn test_unsubscribe_message_for_unknown_context() {
    let h = harness();
    let result = h
        .producer
        .handle_unsubscribe_msg(UnsubscribeMessage {
            dynamic_queue_name: "dyn-1".into(),
            plugin_type: MIRROR_PLUGIN_TYPE.into(),
            context_id: "site-a".into(),
            payload: None,
        })
        .await;

    assert!(matches!(result, Err(FederationError::SessionNotFound(_))));
}

/// A second subscribe for the same context replaces the first session.
#[tokio::test]
async fn test_resubscribe_replaces_session() {
    let h = harness();
    h.producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-old"))
        .await
        .unwrap();
    h.producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-new"))
        .await
        .unwrap();

    assert_eq!(h.producer.session_count(), 1);
    assert_eq!(
        h.producer.session_queue("site-a").as_deref(),
        Some("dyn-new")
    );
    assert_eq!(h.store.listener_count(), 1);
    assert_eq!(h.bus.destroyed_queues(), vec!["dyn-old".to_string()]);

    h.store.put(&inventory().child("after"), json!(true)).unwrap();
    assert_eq!(kinds(&h.bus, "dyn-old"), vec!["StartFullSync", "EndFullSync"]);
    assert_eq!(sequence_ids(&h.bus, "dyn-new"), vec![0, 1, 2]);
}

/// Shutdown tears down every session.
#[tokio::test]
async fn test_shutdown_tears_down_sessions() {
    let h = harness();
    h.producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-a"))
        .await
        .unwrap();
    h.producer
        .handle_subscribe_msg(subscribe("site-c", "dyn-c"))
        .await
        .unwrap();

    h.producer.shutdown().await;

    assert_eq!(h.producer.session_count(), 0);
    assert_eq!(h.store.listener_count(), 0);
    let mut destroyed = h.bus.destroyed_queues();
    destroyed.sort();
    assert_eq!(destroyed, vec!["dyn-a".to_string(), "dyn-c".to_string()]);
}

// =============================================================================
// Failures
// =============================================================================

/// A store read failure sends FullSyncFailed and never EndFullSync.
#[tokio::test]
async fn test_full_sync_failure_halts() {
    let h = harness();
    h.store.fail_reads(true);

    let result = h
        .producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-1"))
        .await;

    assert!(matches!(result, Err(FederationError::FullSyncRead(_))));
    assert_eq!(kinds(&h.bus, "dyn-1"), vec!["StartFullSync", "FullSyncFailed"]);
    assert_eq!(sequence_ids(&h.bus, "dyn-1"), vec![0, 1]);
    assert_eq!(h.store.listener_count(), 0);
    assert_eq!(
        h.producer.metrics().snapshot().full_sync_failed_msg_sent,
        1
    );
}

/// No factory for the plugin type: nothing is created.
#[tokio::test]
async fn test_unknown_plugin_type() {
    let h = harness();
    let mut msg = subscribe("site-a", "dyn-1");
    msg.plugin_type = "topology".into();

    let result = h.producer.handle_subscribe_msg(msg).await;

    assert!(matches!(result, Err(FederationError::UnknownPluginType(_))));
    assert!(!h.bus.queue_exists("dyn-1"));
    assert_eq!(h.producer.session_count(), 0);
}

/// A refusing factory leaves no session and no queue behind.
#[tokio::test]
async fn test_factory_failure_cleans_up() {
    let h = harness();
    h.producer
        .attach_plugin_factory("empty", Arc::new(MirrorFactory::new(Vec::new())))
        .unwrap();
    let mut msg = subscribe("site-a", "dyn-1");
    msg.plugin_type = "empty".into();

    let result = h.producer.handle_subscribe_msg(msg).await;

    assert!(matches!(result, Err(FederationError::PluginFactory(_))));
    assert!(!h.bus.queue_exists("dyn-1"));
    assert_eq!(h.producer.session_count(), 0);
}

/// Mutual subscription asks the local consumer side to resubscribe.
#[tokio::test]
async fn test_mutual_subscription_triggers_resubscribe() {
    let h = harness();
    let mut msg = subscribe("site-a", "dyn-1");
    msg.request_mutual_subscription = true;

    h.producer.handle_subscribe_msg(msg).await.unwrap();

    assert_eq!(h.consumers.triggered(), vec!["site-a".to_string()]);
}

// =============================================================================
// Abort deadline
// =============================================================================

struct StuckEgress {
    path: DataPath,
    cleaned: Arc<Mutex<bool>>,
}

impl EgressPlugin for StuckEgress {
    fn listeners_data(&self) -> Vec<ListenerData> {
        vec![ListenerData::on_path("stuck", self.path.clone())]
    }
    fn full_sync_data(&self, _listener_id: &str, _existing: Option<Value>) -> FederationResult<()> {
        Ok(())
    }
    fn steady_data(&self, _listener_id: &str, _changes: Vec<DataChange>) {}
    fn abort(&self) -> AbortAck {
        Box::pin(futures_util::future::pending())
    }
    fn cleanup(&self) {
        *self.cleaned.lock().unwrap() = true;
    }
}

struct StuckFactory(Arc<Mutex<bool>>);

impl PluginFactory for StuckFactory {
    fn create_egress(
        &self,
        _payload: Option<&Value>,
        _queue_name: &str,
        _context_id: &str,
        _publisher: SessionPublisher,
    ) -> FederationResult<Arc<dyn EgressPlugin>> {
        Ok(Arc::new(StuckEgress {
            path: inventory(),
            cleaned: self.0.clone(),
        }))
    }
}

/// A plugin that never acknowledges abort is torn down after the deadline.
#[tokio::test(start_paused = true)]
async fn test_abort_timeout_proceeds() {
    let h = harness();
    let cleaned = Arc::new(Mutex::new(false));
    h.producer
        .attach_plugin_factory("stuck", Arc::new(StuckFactory(cleaned.clone())))
        .unwrap();
    let mut msg = subscribe("site-a", "dyn-1");
    msg.plugin_type = "stuck".into();
    h.producer.handle_subscribe_msg(msg).await.unwrap();

    let started = tokio::time::Instant::now();
    assert!(h.producer.unsubscribe_consumer("site-a").await);

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(*cleaned.lock().unwrap());
    assert_eq!(h.store.listener_count(), 0);
    assert_eq!(h.bus.destroyed_queues(), vec!["dyn-1".to_string()]);
}

/// Shutdown lets a replacement subscribe stuck on the old plugin's abort finish.
#[tokio::test(start_paused = true)]
async fn test_shutdown_completes_inflight_replacement() {
    let h = harness();
    let cleaned = Arc::new(Mutex::new(false));
    h.producer
        .attach_plugin_factory("stuck", Arc::new(StuckFactory(cleaned.clone())))
        .unwrap();
    h.producer.on_leadership_gained();
    let mut first = subscribe("site-a", "dyn-1");
    first.plugin_type = "stuck".into();
    h.producer.handle_subscribe_msg(first).await.unwrap();

    let mut replacement = subscribe("site-a", "dyn-2");
    replacement.plugin_type = "stuck".into();
    h.bus
        .send(
            &Envelope::Subscribe(replacement),
            &control_queue_name("site-b"),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    h.producer.shutdown().await;

    assert!(*cleaned.lock().unwrap());
    assert!(!h.bus.queue_exists("dyn-1"));
    assert!(!h.bus.queue_exists("dyn-2"));
    let destroyed = h.bus.destroyed_queues();
    assert!(destroyed.contains(&"dyn-1".to_string()));
    assert!(destroyed.contains(&"dyn-2".to_string()));
    assert_eq!(h.producer.session_count(), 0);
    assert_eq!(h.store.listener_count(), 0);
}

// =============================================================================
// Control queue and leadership
// =============================================================================

/// Leadership opens the control queue and its Subscribe messages create sessions.
#[tokio::test]
async fn test_control_queue_dispatch() {
    let h = harness();
    h.producer.on_leadership_gained();
    assert!(h.producer.is_leader());
    assert!(h.producer.has_control_handler());

    let control = control_queue_name("site-b");
    h.bus
        .send(&Envelope::Subscribe(subscribe("site-a", "dyn-1")), &control)
        .unwrap();
    wait_until(|| h.producer.session_count() == 1).await;

    h.bus
        .send(
            &Envelope::Unsubscribe(UnsubscribeMessage {
                dynamic_queue_name: "dyn-1".into(),
                plugin_type: MIRROR_PLUGIN_TYPE.into(),
                context_id: "site-a".into(),
                payload: None,
            }),
            &control,
        )
        .unwrap();
    wait_until(|| h.producer.session_count() == 0).await;

    h.producer.shutdown().await;
    assert!(!h.bus.queue_exists(&control));
}

/// Losing leadership stops consuming the control queue but keeps sessions.
#[tokio::test]
async fn test_leadership_loss_detaches_control_handler() {
    let h = harness();
    h.producer.on_leadership_gained();
    h.producer
        .handle_subscribe_msg(subscribe("site-a", "dyn-1"))
        .await
        .unwrap();

    h.producer.on_leadership_lost();

    assert!(!h.producer.is_leader());
    assert!(!h.producer.has_control_handler());
    assert!(h.bus.queue_exists(&control_queue_name("site-b")));
    assert_eq!(h.producer.session_count(), 1);
}

/// A broker outage on leadership gain is retried on the configured interval.
#[tokio::test(start_paused = true)]
async fn test_control_queue_retry() {
    let h = harness();
    h.bus.set_available(false);

    h.producer.on_leadership_gained();
    assert!(h.producer.is_leader());
    assert!(!h.producer.has_control_handler());
    assert!(h.producer.is_retry_pending());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!h.producer.has_control_handler());

    h.bus.set_available(true);
    tokio::time::sleep(Duration::from_secs(8)).await;

    assert!(h.producer.has_control_handler());
    assert!(h.bus.queue_exists(&control_queue_name("site-b")));
}

/// A disabled service never takes the control queue.
#[tokio::test]
async fn test_disabled_service_ignores_leadership() {
    let mut config = FederationConfig::new("site-b", BrokerEndpoint::new("localhost"));
    config.start_service = false;
    let h = harness_with(config);

    h.producer.on_leadership_gained();

    assert!(!h.producer.is_leader());
    assert!(!h.bus.queue_exists(&control_queue_name("site-b")));
}

/// A non-leader never consumes its control queue.
#[tokio::test]
async fn test_non_leader_leaves_control_queue_alone() {
    let h = harness();
    h.bus
        .create_queue(&control_queue_name("site-b"), &BrokerEndpoint::new("localhost"))
        .unwrap();
    h.bus
        .send(
            &Envelope::Subscribe(subscribe("site-a", "dyn-1")),
            &control_queue_name("site-b"),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.producer.session_count(), 0);
    assert!(!h.bus.has_handler(&control_queue_name("site-b")));
}
