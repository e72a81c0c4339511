//! Mirror plugin
//!
//! Replicates a fixed set of store paths from the producer site's store into
//! the consumer site's store. Entity metadata carries the path; the entity's
//! datastore kind carries the datastore.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use super::errors::{FederationError, FederationResult};
use super::message::EntityMessage;
use super::plugin::{
    abort_done, AbortAck, EgressPlugin, IngressPlugin, ListenerData, PluginFactory,
};
use super::producer::SessionPublisher;
use crate::observability::{Event, Logger};
use crate::store::{DataChange, DataPath, MemoryStore, ModificationKind};

/// Plugin type of the mirror plugin
pub const MIRROR_PLUGIN_TYPE: &str = "mirror";

const ENTITY_TAG: &str = "mirror.value";

/// Creates mirror egress plugins over a fixed path list
pub struct MirrorFactory {
    paths: Vec<DataPath>,
}

impl MirrorFactory {
    /// Mirror the given paths
    pub fn new(paths: Vec<DataPath>) -> Self {
        Self { paths }
    }
}

impl PluginFactory for MirrorFactory {
    fn create_egress(
        &self,
        _payload: Option<&Value>,
        _queue_name: &str,
        _context_id: &str,
        publisher: SessionPublisher,
    ) -> FederationResult<Arc<dyn EgressPlugin>> {
        if self.paths.is_empty() {
            return Err(FederationError::PluginFactory(
                "mirror plugin has no paths".into(),
            ));
        }
        Ok(Arc::new(MirrorEgress {
            paths: self.paths.clone(),
            publisher,
            aborted: AtomicBool::new(false),
        }))
    }
}

/// Producer side of one mirror session
pub struct MirrorEgress {
    paths: Vec<DataPath>,
    publisher: SessionPublisher,
    aborted: AtomicBool,
}

impl MirrorEgress {
    fn path_for(&self, listener_id: &str) -> Option<&DataPath> {
        self.paths.iter().find(|p| p.to_string() == listener_id)
    }

    fn publish(
        &self,
        path: &DataPath,
        kind: ModificationKind,
        value: &Value,
    ) -> FederationResult<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let entity = EntityMessage::encode_tagged(path.kind, kind, value, ENTITY_TAG)?
            .with_metadata(path.path.clone());
        self.publisher.publish(entity).map(|_| ())
    }
}

impl EgressPlugin for MirrorEgress {
    fn listeners_data(&self) -> Vec<ListenerData> {
        self.paths
            .iter()
            .map(|path| ListenerData::on_path(path.to_string(), path.clone()))
            .collect()
    }

    fn full_sync_data(&self, listener_id: &str, existing: Option<Value>) -> FederationResult<()> {
        let path = self
            .path_for(listener_id)
            .ok_or_else(|| FederationError::Internal(format!("unknown listener {}", listener_id)))?;
        match existing {
            Some(value) => self.publish(path, ModificationKind::Write, &value),
            None => Ok(()),
        }
    }

    fn steady_data(&self, _listener_id: &str, changes: Vec<DataChange>) {
        for change in changes {
            let value = match change.kind {
                ModificationKind::Delete => change.before.unwrap_or(Value::Null),
                _ => change.after.unwrap_or(Value::Null),
            };
            // Publish failures are logged by the coordinator
            let _ = self.publish(&change.path, change.kind, &value);
        }
    }

    fn abort(&self) -> AbortAck {
        self.aborted.store(true, Ordering::SeqCst);
        abort_done()
    }
}

/// Counters kept by a mirror ingress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    /// `StartFullSync` accepted
    pub full_syncs_started: u64,
    /// `EndFullSync` accepted
    pub full_syncs_completed: u64,
    /// `FullSyncFailed` accepted
    pub full_syncs_failed: u64,
    /// Entities written or deleted
    pub entities_applied: u64,
    /// Resubscribe requests received
    pub resubscribe_requests: u64,
}

type ResubscribeHook = Box<dyn Fn() + Send + Sync>;

/// Consumer side of the mirror plugin, applying entities to a local store
pub struct MirrorIngress {
    store: MemoryStore,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    applied: AtomicU64,
    resubscribes: AtomicU64,
    resubscribe_hook: Mutex<Option<ResubscribeHook>>,
}

impl MirrorIngress {
    /// Apply into `store`
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            resubscribes: AtomicU64::new(0),
            resubscribe_hook: Mutex::new(None),
        }
    }

    /// Action run on every resubscribe request, typically a new `subscribe`
    pub fn set_resubscribe_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut slot) = self.resubscribe_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Current counters
    pub fn stats(&self) -> MirrorStats {
        MirrorStats {
            full_syncs_started: self.started.load(Ordering::Relaxed),
            full_syncs_completed: self.completed.load(Ordering::Relaxed),
            full_syncs_failed: self.failed.load(Ordering::Relaxed),
            entities_applied: self.applied.load(Ordering::Relaxed),
            resubscribe_requests: self.resubscribes.load(Ordering::Relaxed),
        }
    }

    fn apply(&self, entity: &EntityMessage) -> FederationResult<()> {
        let metadata = entity
            .metadata
            .as_deref()
            .ok_or_else(|| FederationError::Codec("mirror entity without path".into()))?;
        let path = DataPath::new(entity.data_store_kind, metadata);

        match entity.modification_kind {
            ModificationKind::Delete => {
                self.store.delete(&path)?;
            }
            ModificationKind::Write | ModificationKind::SubtreeModified => {
                self.store.put(&path, entity.decode_value()?)?;
            }
        }
        Ok(())
    }
}

impl IngressPlugin for MirrorIngress {
    fn plugin_type(&self) -> &str {
        MIRROR_PLUGIN_TYPE
    }

    fn begin_full_sync(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn end_full_sync(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn full_sync_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn consume_msg(&self, entity: EntityMessage) {
        match self.apply(&entity) {
            Ok(()) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => Logger::error(
                Event::CodecFailed,
                &[
                    ("plugin_type", MIRROR_PLUGIN_TYPE),
                    ("entity_type", &entity.entity_type_tag),
                    ("error", &e.to_string()),
                ],
            ),
        }
    }

    fn resubscribe(&self) {
        self.resubscribes.fetch_add(1, Ordering::Relaxed);
        if let Ok(hook) = self.resubscribe_hook.lock() {
            if let Some(hook) = hook.as_ref() {
                hook();
            }
        }
    }
}
