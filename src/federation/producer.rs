//! # Producer Coordinator
//!
//! Serves subscriptions from remote consumers.
//!
//! ## Session lifecycle
//!
//! A `Subscribe` on this site's control queue creates one session per
//! context id. The session runs a full sync (`StartFullSync`, existing data,
//! `EndFullSync`) and then forwards live changes from store listeners. A
//! second `Subscribe` for the same context id tears the old session down
//! first.
//!
//! ## Concurrency
//!
//! Subscribe, unsubscribe and shutdown run under one coordinator-wide async
//! mutex. `publish_message` takes no coordinator lock: it is called from
//! inside full sync and from store listener callbacks. Per-session ordering
//! comes from the session's sequencer, which holds its lock across sequence
//! assignment and send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use super::config::FederationConfig;
use super::control::{ControlMessage, ControlMessageConsumer};
use super::errors::{FederationError, FederationResult};
use super::leadership::LeadershipListener;
use super::message::{
    EntityMessage, Envelope, SubscribeMessage, UnsubscribeMessage, FIRST_SESSION_SEQUENCE,
};
use super::plugin::{ConsumerManagement, EgressPlugin, PluginFactory, PluginRegistry};
use super::task::{await_with_deadline, DeadlineOutcome, RetryTask};
use crate::observability::{Event, FederationMetrics, Logger};
use crate::store::{ChangeListener, DataChange, DataStore, ListenerRegistration};
use crate::transport::{HandlerTag, MessageBus};

/// Hands out sequence ids for one session and sends under the same lock
struct SessionSequencer {
    next: Mutex<u64>,
}

impl SessionSequencer {
    fn new() -> Self {
        Self {
            next: Mutex::new(FIRST_SESSION_SEQUENCE),
        }
    }

    fn send_start(&self, bus: &dyn MessageBus, queue: &str) -> FederationResult<()> {
        let _next = self.next.lock().map_err(|_| FederationError::poisoned())?;
        bus.send(&Envelope::start_full_sync(), queue)?;
        Ok(())
    }

    /// The id is consumed even when the send fails
    fn send_next(
        &self,
        bus: &dyn MessageBus,
        queue: &str,
        build: impl FnOnce(u64) -> Envelope,
    ) -> FederationResult<u64> {
        let mut next = self.next.lock().map_err(|_| FederationError::poisoned())?;
        let sequence_id = *next;
        *next += 1;
        bus.send(&build(sequence_id), queue)?;
        Ok(sequence_id)
    }
}

struct ProducerSession {
    plugin: Arc<dyn EgressPlugin>,
    plugin_type: String,
    dynamic_queue_name: String,
    sequencer: Arc<SessionSequencer>,
    listeners: Vec<ListenerRegistration>,
}

#[derive(Default)]
struct ControlState {
    handler: Option<HandlerTag>,
    worker: Option<JoinHandle<()>>,
    retry: Option<RetryTask>,
}

struct ProducerInner {
    config: FederationConfig,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn DataStore>,
    consumer_mgmt: Arc<dyn ConsumerManagement>,
    registry: PluginRegistry,
    sessions: RwLock<HashMap<String, ProducerSession>>,
    op_lock: tokio::sync::Mutex<()>,
    leader: AtomicBool,
    stopped: AtomicBool,
    control: Mutex<ControlState>,
    metrics: Arc<FederationMetrics>,
}

/// A plugin's handle for publishing onto its own session
#[derive(Clone)]
pub struct SessionPublisher {
    inner: Weak<ProducerInner>,
    queue_name: String,
    context_id: String,
}

impl SessionPublisher {
    /// Publisher bound to no coordinator; every publish fails
    pub fn detached(queue_name: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            inner: Weak::new(),
            queue_name: queue_name.into(),
            context_id: context_id.into(),
        }
    }

    /// Session queue
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Session context id
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Publish one entity as the session's next `EntityUpdate`
    pub fn publish(&self, entity: EntityMessage) -> FederationResult<u64> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| FederationError::SessionNotFound(self.context_id.clone()))?;
        inner.publish_message(entity, &self.queue_name, &self.context_id)
    }
}

/// Forwards committed store changes of one interest descriptor to the plugin
struct SessionChangeListener {
    listener_id: String,
    plugin: Arc<dyn EgressPlugin>,
    metrics: Arc<FederationMetrics>,
}

impl ChangeListener for SessionChangeListener {
    fn on_changes(&self, changes: Vec<DataChange>) {
        self.metrics.increment_dcn();
        self.plugin.steady_data(&self.listener_id, changes);
    }
}

impl ProducerInner {
    fn control(&self) -> FederationResult<MutexGuard<'_, ControlState>> {
        self.control.lock().map_err(|_| FederationError::poisoned())
    }

    fn publish_message(
        &self,
        entity: EntityMessage,
        queue_name: &str,
        context_id: &str,
    ) -> FederationResult<u64> {
        let sequencer = {
            let sessions = self.sessions.read().map_err(|_| FederationError::poisoned())?;
            match sessions.get(context_id) {
                Some(session) => session.sequencer.clone(),
                None => {
                    Logger::error(
                        Event::SessionNotFound,
                        &[("context_id", context_id), ("queue", queue_name)],
                    );
                    return Err(FederationError::SessionNotFound(context_id.to_string()));
                }
            }
        };

        match sequencer.send_next(self.bus.as_ref(), queue_name, |sequence_id| {
            Envelope::entity_update(sequence_id, entity)
        }) {
            Ok(sequence_id) => {
                self.metrics.increment_msg_published();
                Logger::trace(
                    Event::MessagePublished,
                    &[
                        ("context_id", context_id),
                        ("queue", queue_name),
                        ("sequence_id", &sequence_id.to_string()),
                    ],
                );
                Ok(sequence_id)
            }
            Err(e) => {
                Logger::error(
                    Event::PublishFailed,
                    &[
                        ("context_id", context_id),
                        ("queue", queue_name),
                        ("error", &e.to_string()),
                    ],
                );
                Err(e)
            }
        }
    }

    /// Create the control queue and start consuming it. False if the broker
    /// refused; the caller schedules a retry.
    fn try_open_control_queue(self: &Arc<Self>) -> bool {
        let name = self.config.control_queue();
        if let Err(e) = self.bus.create_queue(&name, &self.config.broker) {
            Logger::warn(
                Event::ControlQueueCreateFailed,
                &[
                    ("queue", &name),
                    ("error", &e.to_string()),
                    (
                        "retry_secs",
                        &self.config.control_queue_retry_secs.to_string(),
                    ),
                ],
            );
            return false;
        }
        Logger::info(Event::ControlQueueCreated, &[("queue", &name)]);

        let (sender, receiver) = mpsc::unbounded_channel();
        let tag = match self
            .bus
            .attach_handler(&name, Box::new(ControlMessageConsumer::new(sender)))
        {
            Ok(tag) => tag,
            Err(e) => {
                Logger::error(
                    Event::ControlQueueCreateFailed,
                    &[("queue", &name), ("error", &e.to_string())],
                );
                return false;
            }
        };

        let worker = tokio::spawn(control_worker(Arc::downgrade(self), receiver));

        let mut control = match self.control() {
            Ok(control) => control,
            Err(e) => {
                Logger::error(Event::ControlQueueCreateFailed, &[("error", &e.to_string())]);
                let _ = self.bus.detach_handler(&name, &tag);
                return false;
            }
        };
        if !self.leader.load(Ordering::SeqCst) {
            // Leadership lost while this attempt was running
            let _ = self.bus.detach_handler(&name, &tag);
            return true;
        }
        control.handler = Some(tag);
        control.worker = Some(worker);
        drop(control);

        Logger::info(Event::ControlHandlerAttached, &[("queue", &name)]);
        true
    }
}

async fn control_worker(inner: Weak<ProducerInner>, mut receiver: UnboundedReceiver<ControlMessage>) {
    while let Some(message) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.stopped.load(Ordering::SeqCst) {
            Logger::warn(
                Event::ControlHandlerDetached,
                &[("dropped", message.context_id())],
            );
            break;
        }
        let coordinator = ProducerCoordinator { inner };
        // Failures are logged where they happen
        let _ = match message {
            ControlMessage::Subscribe(msg) => coordinator.handle_subscribe_msg(msg).await,
            ControlMessage::Unsubscribe(msg) => coordinator.handle_unsubscribe_msg(msg).await,
        };
    }
}

/// Producer side of the federation
#[derive(Clone)]
pub struct ProducerCoordinator {
    inner: Arc<ProducerInner>,
}

impl ProducerCoordinator {
    /// Create a coordinator. It stays idle until leadership is gained.
    pub fn new(
        config: FederationConfig,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn DataStore>,
        consumer_mgmt: Arc<dyn ConsumerManagement>,
        metrics: Arc<FederationMetrics>,
    ) -> Self {
        Logger::info(
            Event::ServiceStart,
            &[("site_id", &config.site_id), ("role", "producer")],
        );
        Self {
            inner: Arc::new(ProducerInner {
                config,
                bus,
                store,
                consumer_mgmt,
                registry: PluginRegistry::new(),
                sessions: RwLock::new(HashMap::new()),
                op_lock: tokio::sync::Mutex::new(()),
                leader: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                control: Mutex::new(ControlState::default()),
                metrics,
            }),
        }
    }

    /// Register the factory for a plugin type. Last writer wins.
    pub fn attach_plugin_factory(
        &self,
        plugin_type: &str,
        factory: Arc<dyn PluginFactory>,
    ) -> FederationResult<()> {
        self.inner.registry.attach(plugin_type, factory)
    }

    /// Remove the factory for a plugin type
    pub fn detach_plugin_factory(&self, plugin_type: &str) -> FederationResult<bool> {
        self.inner.registry.detach(plugin_type)
    }

    /// Open or replace the session for `msg.context_id` and run its full sync.
    ///
    /// Returns `Err` when the subscribe stopped short. The session stays
    /// registered after a full-sync failure until it is replaced or removed.
    pub async fn handle_subscribe_msg(&self, msg: SubscribeMessage) -> FederationResult<()> {
        let _op = self.inner.op_lock.lock().await;
        let inner = &self.inner;

        let Some(factory) = inner.registry.get(&msg.plugin_type)? else {
            Logger::error(
                Event::UnknownPluginType,
                &[
                    ("plugin_type", &msg.plugin_type),
                    ("context_id", &msg.context_id),
                ],
            );
            return Err(FederationError::UnknownPluginType(msg.plugin_type));
        };

        self.teardown_session(&msg.context_id).await;

        let queue = msg.dynamic_queue_name.clone();
        if let Err(e) = inner.bus.create_queue(&queue, &inner.config.broker) {
            Logger::error(
                Event::QueueCreateFailed,
                &[("queue", &queue), ("error", &e.to_string())],
            );
        }

        let publisher = SessionPublisher {
            inner: Arc::downgrade(inner),
            queue_name: queue.clone(),
            context_id: msg.context_id.clone(),
        };
        let plugin =
            match factory.create_egress(msg.payload.as_ref(), &queue, &msg.context_id, publisher) {
                Ok(plugin) => plugin,
                Err(e) => {
                    Logger::error(
                        Event::PluginFactoryFailed,
                        &[
                            ("plugin_type", &msg.plugin_type),
                            ("context_id", &msg.context_id),
                            ("error", &e.to_string()),
                        ],
                    );
                    let _ = inner.bus.destroy_queue(&queue);
                    return Err(e);
                }
            };

        let sequencer = Arc::new(SessionSequencer::new());
        inner
            .sessions
            .write()
            .map_err(|_| FederationError::poisoned())?
            .insert(
                msg.context_id.clone(),
                ProducerSession {
                    plugin: plugin.clone(),
                    plugin_type: msg.plugin_type.clone(),
                    dynamic_queue_name: queue.clone(),
                    sequencer: sequencer.clone(),
                    listeners: Vec::new(),
                },
            );
        Logger::info(
            Event::SessionCreated,
            &[
                ("context_id", &msg.context_id),
                ("plugin_type", &msg.plugin_type),
                ("queue", &queue),
            ],
        );

        let interests = plugin.listeners_data();

        match sequencer.send_start(inner.bus.as_ref(), &queue) {
            Ok(()) => {
                inner.metrics.increment_start_full_sync_msg_sent();
                Logger::info(Event::FullSyncStartSent, &[("queue", &queue)]);
            }
            Err(e) => Logger::error(
                Event::PublishFailed,
                &[("queue", &queue), ("error", &e.to_string())],
            ),
        }

        for interest in &interests {
            let synced = inner
                .store
                .read(&interest.existing_data_path)
                .map_err(FederationError::from)
                .and_then(|existing| plugin.full_sync_data(&interest.listener_id, existing));

            if let Err(e) = synced {
                Logger::error(
                    Event::FullSyncReadFailed,
                    &[
                        ("context_id", &msg.context_id),
                        ("listener_id", &interest.listener_id),
                        ("path", &interest.existing_data_path.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                match sequencer.send_next(inner.bus.as_ref(), &queue, Envelope::full_sync_failed) {
                    Ok(sequence_id) => {
                        inner.metrics.increment_full_sync_failed_msg_sent();
                        Logger::warn(
                            Event::FullSyncFailedSent,
                            &[("queue", &queue), ("sequence_id", &sequence_id.to_string())],
                        );
                    }
                    Err(send_err) => Logger::error(
                        Event::PublishFailed,
                        &[("queue", &queue), ("error", &send_err.to_string())],
                    ),
                }
                return Err(FederationError::FullSyncRead(e.to_string()));
            }
        }

        match sequencer.send_next(inner.bus.as_ref(), &queue, Envelope::end_full_sync) {
            Ok(sequence_id) => {
                inner.metrics.increment_end_full_sync_msg_sent();
                Logger::info(
                    Event::FullSyncEndSent,
                    &[("queue", &queue), ("sequence_id", &sequence_id.to_string())],
                );
            }
            Err(e) => Logger::error(
                Event::PublishFailed,
                &[("queue", &queue), ("error", &e.to_string())],
            ),
        }

        let mut registrations = Vec::with_capacity(interests.len());
        for interest in interests {
            let listener = Arc::new(SessionChangeListener {
                listener_id: interest.listener_id.clone(),
                plugin: plugin.clone(),
                metrics: inner.metrics.clone(),
            });
            match inner
                .store
                .register_change_listener(&interest.listener_path, listener)
            {
                Ok(registration) => {
                    Logger::info(
                        Event::ListenerRegistered,
                        &[
                            ("context_id", &msg.context_id),
                            ("listener_id", &interest.listener_id),
                            ("path", &interest.listener_path.to_string()),
                        ],
                    );
                    registrations.push(registration);
                }
                Err(e) => Logger::error(
                    Event::ListenerRegisterFailed,
                    &[
                        ("context_id", &msg.context_id),
                        ("listener_id", &interest.listener_id),
                        ("error", &e.to_string()),
                    ],
                ),
            }
        }
        if let Some(session) = inner
            .sessions
            .write()
            .map_err(|_| FederationError::poisoned())?
            .get_mut(&msg.context_id)
        {
            session.listeners.extend(registrations);
        }

        if msg.request_mutual_subscription {
            Logger::info(
                Event::MutualSubscriptionTriggered,
                &[("subscriber_id", &msg.subscriber_id)],
            );
            if let Err(e) = inner
                .consumer_mgmt
                .trigger_plugin_resubscription(&msg.subscriber_id)
            {
                Logger::error(
                    Event::SubscriptionNotFound,
                    &[("subscriber_id", &msg.subscriber_id), ("error", &e.to_string())],
                );
            }
        }

        Ok(())
    }

    /// Tear down the session for `msg.context_id`
    pub async fn handle_unsubscribe_msg(&self, msg: UnsubscribeMessage) -> FederationResult<()> {
        if self.unsubscribe_consumer(&msg.context_id).await {
            Ok(())
        } else {
            Err(FederationError::SessionNotFound(msg.context_id))
        }
    }

    /// Wrap an entity in the session's next `EntityUpdate` and send it
    pub fn publish_message(
        &self,
        entity: EntityMessage,
        queue_name: &str,
        context_id: &str,
    ) -> FederationResult<u64> {
        self.inner.publish_message(entity, queue_name, context_id)
    }

    /// Tear down a session. Returns whether one existed.
    pub async fn unsubscribe_consumer(&self, context_id: &str) -> bool {
        let _op = self.inner.op_lock.lock().await;
        let existed = self.teardown_session(context_id).await;
        if !existed {
            Logger::warn(Event::SessionNotFound, &[("context_id", context_id)]);
        }
        existed
    }

    /// Caller holds the op lock
    async fn teardown_session(&self, context_id: &str) -> bool {
        let removed = match self.inner.sessions.write() {
            Ok(mut sessions) => sessions.remove(context_id),
            Err(_) => {
                Logger::error(
                    Event::SessionNotFound,
                    &[("context_id", context_id), ("error", "Lock poisoned")],
                );
                return false;
            }
        };
        let Some(session) = removed else {
            return false;
        };

        let timeout = self.inner.config.abort_timeout();
        if await_with_deadline(session.plugin.abort(), timeout).await == DeadlineOutcome::TimedOut {
            Logger::warn(
                Event::PluginAbortTimeout,
                &[
                    ("context_id", context_id),
                    ("timeout_ms", &timeout.as_millis().to_string()),
                ],
            );
        }

        let closed = session.listeners.len();
        for registration in session.listeners {
            registration.close();
        }
        if closed > 0 {
            Logger::info(
                Event::ListenerClosed,
                &[("context_id", context_id), ("count", &closed.to_string())],
            );
        }

        session.plugin.cleanup();

        match self.inner.bus.destroy_queue(&session.dynamic_queue_name) {
            Ok(()) => Logger::info(
                Event::DynamicQueueDestroyed,
                &[("queue", &session.dynamic_queue_name)],
            ),
            Err(e) => Logger::warn(
                Event::DynamicQueueDestroyFailed,
                &[("queue", &session.dynamic_queue_name), ("error", &e.to_string())],
            ),
        }

        Logger::info(
            Event::SessionTornDown,
            &[
                ("context_id", context_id),
                ("plugin_type", &session.plugin_type),
            ],
        );
        true
    }

    /// Tear down every session, stop consuming and destroy the control queue
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let (retry, handler, worker) = match inner.control() {
            Ok(mut control) => (
                control.retry.take(),
                control.handler.take(),
                control.worker.take(),
            ),
            Err(_) => (None, None, None),
        };
        inner.leader.store(false, Ordering::SeqCst);
        inner.stopped.store(true, Ordering::SeqCst);

        let control_queue = inner.config.control_queue();
        if let Some(retry) = retry {
            retry.cancel();
        }
        if let Some(tag) = handler {
            let _ = inner.bus.detach_handler(&control_queue, &tag);
        }

        // A control request already in progress runs to completion, teardown included
        let _op = inner.op_lock.lock().await;
        if let Some(worker) = worker {
            worker.abort();
        }
        let contexts: Vec<String> = match inner.sessions.read() {
            Ok(sessions) => sessions.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for context_id in contexts {
            self.teardown_session(&context_id).await;
        }

        if inner.bus.destroy_queue(&control_queue).is_ok() {
            Logger::info(Event::ControlQueueDestroyed, &[("queue", &control_queue)]);
        }
        Logger::info(Event::ServiceStop, &[("site_id", &inner.config.site_id)]);
    }

    fn gain_leadership(&self) -> FederationResult<()> {
        let inner = &self.inner;
        if !inner.config.start_service {
            Logger::warn(Event::ServiceDisabled, &[("site_id", &inner.config.site_id)]);
            return Err(FederationError::ServiceDisabled);
        }
        if inner.leader.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        Logger::info(
            Event::LeadershipGained,
            &[("site_id", &inner.config.site_id), ("role", "producer")],
        );

        if Handle::try_current().is_err() {
            inner.leader.store(false, Ordering::SeqCst);
            return Err(FederationError::Internal(
                "Leadership gained outside a tokio runtime".into(),
            ));
        }

        if inner.try_open_control_queue() {
            return Ok(());
        }

        let weak = Arc::downgrade(inner);
        let retry = RetryTask::spawn(inner.config.control_queue_retry(), move || {
            match weak.upgrade() {
                Some(inner) => !inner.leader.load(Ordering::SeqCst) || inner.try_open_control_queue(),
                None => true,
            }
        });
        inner.control()?.retry = Some(retry);
        Ok(())
    }

    fn lose_leadership(&self) -> FederationResult<()> {
        let inner = &self.inner;
        if !inner.leader.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        Logger::info(
            Event::LeadershipLost,
            &[("site_id", &inner.config.site_id), ("role", "producer")],
        );

        let (retry, handler) = {
            let mut control = inner.control()?;
            (control.retry.take(), control.handler.take())
        };
        if let Some(retry) = retry {
            retry.cancel();
        }
        if let Some(tag) = handler {
            let queue = inner.config.control_queue();
            inner.bus.detach_handler(&queue, &tag)?;
            Logger::info(Event::ControlHandlerDetached, &[("queue", &queue)]);
        }
        Ok(())
    }

    /// True while leadership is held
    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Dynamic queue of a session
    pub fn session_queue(&self, context_id: &str) -> Option<String> {
        self.inner
            .sessions
            .read()
            .ok()?
            .get(context_id)
            .map(|s| s.dynamic_queue_name.clone())
    }

    /// Open listener registrations of a session
    pub fn session_listener_count(&self, context_id: &str) -> usize {
        self.inner
            .sessions
            .read()
            .ok()
            .and_then(|s| s.get(context_id).map(|s| s.listeners.len()))
            .unwrap_or(0)
    }

    /// True while this site consumes its control queue
    pub fn has_control_handler(&self) -> bool {
        self.inner
            .control()
            .map(|c| c.handler.is_some())
            .unwrap_or(false)
    }

    /// True while control queue creation is being retried
    pub fn is_retry_pending(&self) -> bool {
        self.inner
            .control()
            .map(|c| c.retry.as_ref().map(|r| !r.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Shared counters
    pub fn metrics(&self) -> Arc<FederationMetrics> {
        self.inner.metrics.clone()
    }
}

impl LeadershipListener for ProducerCoordinator {
    fn on_leadership_gained(&self) {
        if let Err(e) = self.gain_leadership() {
            if !matches!(e, FederationError::ServiceDisabled) {
                Logger::error(Event::LeadershipGained, &[("error", &e.to_string())]);
            }
        }
    }

    fn on_leadership_lost(&self) {
        if let Err(e) = self.lose_leadership() {
            Logger::error(Event::LeadershipLost, &[("error", &e.to_string())]);
        }
    }
}
