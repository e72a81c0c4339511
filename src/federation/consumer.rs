//! # Consumer Coordinator
//!
//! Subscribes this site to remote producers. One subscription per remote
//! site: a dynamic queue on the remote broker, a fresh delivery guard
//! consuming it, and the ingress plugin behind the guard.
//!
//! Subscribe and unsubscribe require leadership and run under one
//! coordinator-wide async mutex. Losing leadership blocks new calls but keeps
//! existing subscriptions delivering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::config::{FederationConfig, SiteRegistry};
use super::errors::{FederationError, FederationResult};
use super::guard::SequencedDeliveryGuard;
use super::leadership::LeadershipListener;
use super::message::{Envelope, SubscribeMessage, UnsubscribeMessage};
use super::naming;
use super::plugin::{ConsumerManagement, IngressPlugin};
use super::task::{await_with_deadline, DeadlineOutcome};
use crate::observability::{Event, FederationMetrics, Logger};
use crate::transport::MessageBus;

struct RemoteSubscription {
    ingress: Arc<dyn IngressPlugin>,
    dynamic_queue_name: String,
}

struct ConsumerInner {
    config: FederationConfig,
    bus: Arc<dyn MessageBus>,
    sites: Arc<dyn SiteRegistry>,
    subscriptions: RwLock<HashMap<String, RemoteSubscription>>,
    op_lock: tokio::sync::Mutex<()>,
    leader: AtomicBool,
    metrics: Arc<FederationMetrics>,
}

/// Consumer side of the federation
#[derive(Clone)]
pub struct ConsumerCoordinator {
    inner: Arc<ConsumerInner>,
}

impl ConsumerCoordinator {
    /// Create a coordinator. Subscribe calls are refused until leadership is gained.
    pub fn new(
        config: FederationConfig,
        bus: Arc<dyn MessageBus>,
        sites: Arc<dyn SiteRegistry>,
        metrics: Arc<FederationMetrics>,
    ) -> Self {
        Logger::info(
            Event::ServiceStart,
            &[("site_id", &config.site_id), ("role", "consumer")],
        );
        Self {
            inner: Arc::new(ConsumerInner {
                config,
                bus,
                sites,
                subscriptions: RwLock::new(HashMap::new()),
                op_lock: tokio::sync::Mutex::new(()),
                leader: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    fn require_leader(&self, operation: &str, remote_id: &str) -> FederationResult<()> {
        if self.inner.leader.load(Ordering::SeqCst) {
            return Ok(());
        }
        Logger::error(
            Event::NotLeader,
            &[("operation", operation), ("remote", remote_id)],
        );
        Err(FederationError::NotLeader)
    }

    fn destroy_dynamic_queue(&self, remote_id: &str, queue: &str) {
        match self.inner.bus.destroy_queue(queue) {
            Ok(()) => {
                self.inner.metrics.increment_dynamic_queue_destroyed();
                Logger::info(
                    Event::DynamicQueueDestroyed,
                    &[("remote", remote_id), ("queue", queue)],
                );
            }
            Err(e) => Logger::warn(
                Event::DynamicQueueDestroyFailed,
                &[("remote", remote_id), ("queue", queue), ("error", &e.to_string())],
            ),
        }
    }

    /// Subscribe to a remote site, replacing any previous subscription to it.
    ///
    /// Returns the new dynamic queue name. If that queue cannot be declared,
    /// the subscription is still recorded and Subscribe still sent, and the
    /// call returns `QueueCreation`.
    pub async fn subscribe(
        &self,
        remote_id: &str,
        payload: Option<Value>,
        ingress: Arc<dyn IngressPlugin>,
        request_mutual_subscription: bool,
    ) -> FederationResult<String> {
        self.require_leader("subscribe", remote_id)?;
        let _op = self.inner.op_lock.lock().await;
        let inner = &self.inner;

        let Some(site) = inner.sites.resolve(remote_id) else {
            Logger::error(Event::RemoteSiteUnknown, &[("remote", remote_id)]);
            return Err(FederationError::UnknownRemoteSite(remote_id.to_string()));
        };

        let control_queue = site.control_queue();
        match inner.bus.create_queue(&control_queue, &site.broker) {
            Ok(()) => {
                inner.metrics.increment_remote_control_queue_created();
                Logger::info(
                    Event::RemoteControlQueueCreated,
                    &[("remote", remote_id), ("queue", &control_queue)],
                );
            }
            Err(e) => Logger::warn(
                Event::QueueCreateFailed,
                &[("remote", remote_id), ("queue", &control_queue), ("error", &e.to_string())],
            ),
        }

        let previous = inner
            .subscriptions
            .write()
            .map_err(|_| FederationError::poisoned())?
            .remove(remote_id);
        if let Some(previous) = previous {
            self.destroy_dynamic_queue(remote_id, &previous.dynamic_queue_name);
        }

        let queue = naming::dynamic_queue_name(remote_id, &inner.config.site_id);
        // Without a queue the record and the Subscribe still go out
        let queue_error = match inner.bus.create_queue(&queue, &site.broker) {
            Ok(()) => {
                inner.metrics.increment_dynamic_queue_created();
                Logger::info(
                    Event::DynamicQueueCreated,
                    &[("remote", remote_id), ("queue", &queue)],
                );

                let guard =
                    SequencedDeliveryGuard::new(remote_id, ingress.clone(), inner.metrics.clone());
                if let Err(e) = inner.bus.attach_handler(&queue, Box::new(guard)) {
                    Logger::error(
                        Event::GuardAttachFailed,
                        &[("remote", remote_id), ("queue", &queue), ("error", &e.to_string())],
                    );
                    self.destroy_dynamic_queue(remote_id, &queue);
                    return Err(e.into());
                }
                None
            }
            Err(e) => {
                Logger::error(
                    Event::QueueCreateFailed,
                    &[("remote", remote_id), ("queue", &queue), ("error", &e.to_string())],
                );
                Some(FederationError::QueueCreation(e.to_string()))
            }
        };

        inner
            .subscriptions
            .write()
            .map_err(|_| FederationError::poisoned())?
            .insert(
                remote_id.to_string(),
                RemoteSubscription {
                    ingress: ingress.clone(),
                    dynamic_queue_name: queue.clone(),
                },
            );

        let subscribe = Envelope::Subscribe(SubscribeMessage {
            dynamic_queue_name: queue.clone(),
            plugin_type: ingress.plugin_type().to_string(),
            payload,
            subscriber_id: inner.config.site_id.clone(),
            context_id: inner.config.site_id.clone(),
            request_mutual_subscription,
        });
        if let Err(e) = inner.bus.send(&subscribe, &control_queue) {
            Logger::error(
                Event::SubscribeSendFailed,
                &[("remote", remote_id), ("queue", &control_queue), ("error", &e.to_string())],
            );
            return Err(queue_error.unwrap_or_else(|| e.into()));
        }
        inner.metrics.increment_subscription_message_sent();
        Logger::info(
            Event::SubscribeSent,
            &[
                ("remote", remote_id),
                ("queue", &queue),
                ("plugin_type", ingress.plugin_type()),
                (
                    "mutual",
                    if request_mutual_subscription { "true" } else { "false" },
                ),
            ],
        );

        match queue_error {
            Some(e) => Err(e),
            None => Ok(queue),
        }
    }

    /// Close the subscription to a remote site
    pub async fn unsubscribe(&self, remote_id: &str) -> FederationResult<()> {
        self.require_leader("unsubscribe", remote_id)?;
        let _op = self.inner.op_lock.lock().await;
        let inner = &self.inner;

        let removed = inner
            .subscriptions
            .write()
            .map_err(|_| FederationError::poisoned())?
            .remove(remote_id);
        let Some(subscription) = removed else {
            Logger::warn(Event::SubscriptionNotFound, &[("remote", remote_id)]);
            return Err(FederationError::SubscriptionNotFound(remote_id.to_string()));
        };

        let site = inner.sites.resolve(remote_id);
        match &site {
            Some(site) => {
                let unsubscribe = Envelope::Unsubscribe(UnsubscribeMessage {
                    dynamic_queue_name: subscription.dynamic_queue_name.clone(),
                    plugin_type: subscription.ingress.plugin_type().to_string(),
                    context_id: inner.config.site_id.clone(),
                    payload: None,
                });
                match inner.bus.send(&unsubscribe, &site.control_queue()) {
                    Ok(()) => {
                        inner.metrics.increment_unsubscription_message_sent();
                        Logger::info(
                            Event::UnsubscribeSent,
                            &[("remote", remote_id), ("queue", &subscription.dynamic_queue_name)],
                        );
                    }
                    Err(e) => Logger::error(
                        Event::UnsubscribeSent,
                        &[("remote", remote_id), ("error", &e.to_string())],
                    ),
                }
            }
            None => Logger::error(Event::RemoteSiteUnknown, &[("remote", remote_id)]),
        }

        self.destroy_dynamic_queue(remote_id, &subscription.dynamic_queue_name);

        match site {
            Some(_) => Ok(()),
            None => Err(FederationError::UnknownRemoteSite(remote_id.to_string())),
        }
    }

    /// Ask the ingress plugin subscribed to `remote_id` to subscribe again
    pub fn trigger_plugin_resubscription(&self, remote_id: &str) -> FederationResult<()> {
        let ingress = self
            .inner
            .subscriptions
            .read()
            .map_err(|_| FederationError::poisoned())?
            .get(remote_id)
            .map(|s| s.ingress.clone());

        match ingress {
            Some(ingress) => {
                Logger::info(Event::ResubscriptionTriggered, &[("remote", remote_id)]);
                ingress.resubscribe();
                Ok(())
            }
            None => {
                Logger::error(Event::SubscriptionNotFound, &[("remote", remote_id)]);
                Err(FederationError::SubscriptionNotFound(remote_id.to_string()))
            }
        }
    }

    /// Unsubscribe from every remote best-effort and abort the ingress plugins
    pub async fn shutdown(&self) {
        let remotes: Vec<String> = match self.inner.subscriptions.read() {
            Ok(subscriptions) => subscriptions.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };

        for remote_id in remotes {
            let ingress = self
                .inner
                .subscriptions
                .read()
                .ok()
                .and_then(|s| s.get(&remote_id).map(|s| s.ingress.clone()));

            if self.is_leader() {
                let _ = self.unsubscribe(&remote_id).await;
            } else {
                let _op = self.inner.op_lock.lock().await;
                let removed = self
                    .inner
                    .subscriptions
                    .write()
                    .ok()
                    .and_then(|mut s| s.remove(&remote_id));
                if let Some(subscription) = removed {
                    self.destroy_dynamic_queue(&remote_id, &subscription.dynamic_queue_name);
                }
            }

            if let Some(ingress) = ingress {
                let timeout = self.inner.config.abort_timeout();
                if await_with_deadline(ingress.abort(), timeout).await == DeadlineOutcome::TimedOut {
                    Logger::warn(
                        Event::PluginAbortTimeout,
                        &[
                            ("remote", &remote_id),
                            ("timeout_ms", &timeout.as_millis().to_string()),
                        ],
                    );
                }
            }
        }

        self.inner.leader.store(false, Ordering::SeqCst);
    }

    /// True while leadership is held
    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }

    /// Dynamic queue of the subscription to a remote
    pub fn subscription_queue(&self, remote_id: &str) -> Option<String> {
        self.inner
            .subscriptions
            .read()
            .ok()?
            .get(remote_id)
            .map(|s| s.dynamic_queue_name.clone())
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Shared counters
    pub fn metrics(&self) -> Arc<FederationMetrics> {
        self.inner.metrics.clone()
    }
}

impl ConsumerManagement for ConsumerCoordinator {
    fn trigger_plugin_resubscription(&self, remote_id: &str) -> FederationResult<()> {
        ConsumerCoordinator::trigger_plugin_resubscription(self, remote_id)
    }
}

impl LeadershipListener for ConsumerCoordinator {
    fn on_leadership_gained(&self) {
        if !self.inner.config.start_service {
            Logger::warn(
                Event::ServiceDisabled,
                &[("site_id", &self.inner.config.site_id)],
            );
            return;
        }
        if !self.inner.leader.swap(true, Ordering::SeqCst) {
            Logger::info(
                Event::LeadershipGained,
                &[("site_id", &self.inner.config.site_id), ("role", "consumer")],
            );
        }
    }

    fn on_leadership_lost(&self) {
        if self.inner.leader.swap(false, Ordering::SeqCst) {
            Logger::info(
                Event::LeadershipLost,
                &[
                    ("site_id", &self.inner.config.site_id),
                    ("role", "consumer"),
                    ("subscriptions", &self.subscription_count().to_string()),
                ],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::config::StaticSiteRegistry;
    use crate::transport::{BrokerEndpoint, InMemoryBus};

    fn coordinator(start_service: bool) -> ConsumerCoordinator {
        let mut config = FederationConfig::new("site-a", BrokerEndpoint::new("localhost"));
        config.start_service = start_service;
        ConsumerCoordinator::new(
            config,
            Arc::new(InMemoryBus::new()),
            Arc::new(StaticSiteRegistry::default()),
            Arc::new(FederationMetrics::new()),
        )
    }

    #[test]
    fn test_leadership_flag() {
        let consumer = coordinator(true);
        assert!(!consumer.is_leader());

        consumer.on_leadership_gained();
        assert!(consumer.is_leader());

        consumer.on_leadership_lost();
        assert!(!consumer.is_leader());
    }

    #[test]
    fn test_disabled_service_ignores_leadership() {
        let consumer = coordinator(false);
        consumer.on_leadership_gained();
        assert!(!consumer.is_leader());
    }

    #[test]
    fn test_trigger_unknown_remote() {
        let consumer = coordinator(true);
        assert!(matches!(
            consumer.trigger_plugin_resubscription("site-b"),
            Err(FederationError::SubscriptionNotFound(_))
        ));
    }
}
