//! In-memory data store with change notification
//!
//! Each `put`/`delete` commits one change and notifies every listener
//! registered on the changed path or an ancestor of it. Listeners run on the
//! committing thread after all store locks are released.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;

use super::{
    ChangeListener, DataChange, DataPath, DataStore, ListenerRegistration, ModificationKind,
    StoreError, StoreResult,
};

type ListenerMap = HashMap<u64, (DataPath, Arc<dyn ChangeListener>)>;

struct Inner {
    data: RwLock<BTreeMap<DataPath, Value>>,
    listeners: RwLock<ListenerMap>,
    next_listener: AtomicU64,
    fail_reads: AtomicBool,
}

/// In-memory transactional store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

fn poisoned() -> StoreError {
    StoreError::Internal("Lock poisoned".into())
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(BTreeMap::new()),
                listeners: RwLock::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                fail_reads: AtomicBool::new(false),
            }),
        }
    }

    /// Write a value and notify listeners
    pub fn put(&self, path: &DataPath, value: Value) -> StoreResult<()> {
        let before = self
            .inner
            .data
            .write()
            .map_err(|_| poisoned())?
            .insert(path.clone(), value.clone());

        self.notify(DataChange {
            path: path.clone(),
            kind: ModificationKind::Write,
            before,
            after: Some(value),
        })
    }

    /// Remove a value and notify listeners. Returns false if nothing was stored.
    pub fn delete(&self, path: &DataPath) -> StoreResult<bool> {
        let before = self.inner.data.write().map_err(|_| poisoned())?.remove(path);
        if before.is_none() {
            return Ok(false);
        }

        self.notify(DataChange {
            path: path.clone(),
            kind: ModificationKind::Delete,
            before,
            after: None,
        })?;
        Ok(true)
    }

    /// Make every subsequent `read` fail until switched back
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of open listener registrations
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Stored values at or below a path, in path order
    pub fn entries_under(&self, root: &DataPath) -> StoreResult<Vec<(DataPath, Value)>> {
        let data = self.inner.data.read().map_err(|_| poisoned())?;
        Ok(data
            .iter()
            .filter(|(path, _)| root.is_ancestor_of(path))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect())
    }

    fn notify(&self, change: DataChange) -> StoreResult<()> {
        let targets: Vec<Arc<dyn ChangeListener>> = self
            .inner
            .listeners
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|(path, _)| path.is_ancestor_of(&change.path))
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in targets {
            listener.on_changes(vec![change.clone()]);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore for MemoryStore {
    fn read(&self, path: &DataPath) -> StoreResult<Option<Value>> {
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::ReadFailed {
                path: path.to_string(),
                reason: "read transaction failed".into(),
            });
        }
        let data = self.inner.data.read().map_err(|_| poisoned())?;
        Ok(data.get(path).cloned())
    }

    fn register_change_listener(
        &self,
        path: &DataPath,
        listener: Arc<dyn ChangeListener>,
    ) -> StoreResult<ListenerRegistration> {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .map_err(|_| StoreError::RegistrationFailed(path.to_string()))?
            .insert(id, (path.clone(), listener));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(ListenerRegistration::new(path.clone(), move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut listeners) = inner.listeners.write() {
                    listeners.remove(&id);
                }
            }
        }))
    }
}
