//! # Plugin SPI
//!
//! Extension points that supply entities on the producer side and consume
//! them on the consumer side, plus the type→factory registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::{self, BoxFuture};
use serde_json::Value;

use super::errors::{FederationError, FederationResult};
use super::message::EntityMessage;
use super::producer::SessionPublisher;
use crate::observability::{Event, Logger};
use crate::store::{DataChange, DataPath};

/// Completion signal of a plugin abort. Awaited with a deadline.
pub type AbortAck = BoxFuture<'static, ()>;

/// An already-completed abort
pub fn abort_done() -> AbortAck {
    Box::pin(future::ready(()))
}

/// One interest descriptor of an egress plugin
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerData {
    /// Id handed back on every full-sync and steady callback
    pub listener_id: String,
    /// Path watched for live changes
    pub listener_path: DataPath,
    /// Path read once for existing data
    pub existing_data_path: DataPath,
}

impl ListenerData {
    /// Descriptor that watches and reads the same path
    pub fn on_path(listener_id: impl Into<String>, path: DataPath) -> Self {
        Self {
            listener_id: listener_id.into(),
            listener_path: path.clone(),
            existing_data_path: path,
        }
    }
}

/// Producer-side session logic created per subscribe
pub trait EgressPlugin: Send + Sync {
    /// Interest descriptors, queried once per session
    fn listeners_data(&self) -> Vec<ListenerData>;

    /// Existing data for one descriptor, during full sync
    fn full_sync_data(&self, listener_id: &str, existing: Option<Value>) -> FederationResult<()>;

    /// Live change batch for one descriptor, after full sync
    fn steady_data(&self, listener_id: &str, changes: Vec<DataChange>);

    /// Stop producing. The returned future resolves once the plugin has stopped.
    fn abort(&self) -> AbortAck {
        abort_done()
    }

    /// Release plugin resources after abort
    fn cleanup(&self) {}
}

/// Creates egress plugins for one plugin type
pub trait PluginFactory: Send + Sync {
    /// Create the egress side of a new session
    fn create_egress(
        &self,
        payload: Option<&Value>,
        queue_name: &str,
        context_id: &str,
        publisher: SessionPublisher,
    ) -> FederationResult<Arc<dyn EgressPlugin>>;
}

/// Consumer-side sink behind a delivery guard
pub trait IngressPlugin: Send + Sync {
    /// Plugin type sent in `Subscribe`
    fn plugin_type(&self) -> &str;

    /// `StartFullSync` accepted
    fn begin_full_sync(&self);

    /// `EndFullSync` accepted
    fn end_full_sync(&self);

    /// `FullSyncFailed` accepted
    fn full_sync_failed(&self) {}

    /// Entity accepted
    fn consume_msg(&self, entity: EntityMessage);

    /// The stream broke; the plugin must subscribe again
    fn resubscribe(&self);

    /// Stop consuming
    fn abort(&self) -> AbortAck {
        abort_done()
    }
}

/// Consumer-management collaborator the producer uses for mutual subscription
pub trait ConsumerManagement: Send + Sync {
    /// Ask the ingress plugin subscribed to `remote_id` to subscribe again
    fn trigger_plugin_resubscription(&self, remote_id: &str) -> FederationResult<()>;
}

/// Thread-safe plugin type → factory mapping
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, Arc<dyn PluginFactory>>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Last writer wins.
    pub fn attach(&self, plugin_type: &str, factory: Arc<dyn PluginFactory>) -> FederationResult<()> {
        let replaced = self
            .factories
            .write()
            .map_err(|_| FederationError::poisoned())?
            .insert(plugin_type.to_string(), factory)
            .is_some();

        Logger::info(
            Event::PluginFactoryAttached,
            &[
                ("plugin_type", plugin_type),
                ("replaced", if replaced { "true" } else { "false" }),
            ],
        );
        Ok(())
    }

    /// Remove a factory. Returns true if one was registered.
    pub fn detach(&self, plugin_type: &str) -> FederationResult<bool> {
        let removed = self
            .factories
            .write()
            .map_err(|_| FederationError::poisoned())?
            .remove(plugin_type)
            .is_some();

        if removed {
            Logger::info(Event::PluginFactoryDetached, &[("plugin_type", plugin_type)]);
        }
        Ok(removed)
    }

    /// Look up a factory
    pub fn get(&self, plugin_type: &str) -> FederationResult<Option<Arc<dyn PluginFactory>>> {
        Ok(self
            .factories
            .read()
            .map_err(|_| FederationError::poisoned())?
            .get(plugin_type)
            .cloned())
    }

    /// True if a factory is registered for the type
    pub fn contains(&self, plugin_type: &str) -> bool {
        self.factories
            .read()
            .map(|f| f.contains_key(plugin_type))
            .unwrap_or(false)
    }

    /// Number of registered plugin types
    pub fn len(&self) -> usize {
        self.factories.read().map(|f| f.len()).unwrap_or(0)
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
