//! # Data Store
//!
//! The transactional data-store contract producer sessions read existing data
//! from and register change listeners on, plus an in-memory implementation.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Read transaction failed
    #[error("Read failed at {path}: {reason}")]
    ReadFailed {
        /// Path being read
        path: String,
        /// Cause
        reason: String,
    },

    /// Listener could not be registered
    #[error("Listener registration failed at {0}")]
    RegistrationFailed(String),

    /// Internal store failure
    #[error("Store internal error: {0}")]
    Internal(String),
}

/// Which datastore a path lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreKind {
    /// Intended configuration
    Config,
    /// Observed state
    Operational,
}

/// How a node changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    /// Node created or replaced
    Write,
    /// Only descendants changed
    SubtreeModified,
    /// Node removed
    Delete,
}

/// Address of a node: datastore plus `/`-separated path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataPath {
    /// Datastore
    pub kind: DatastoreKind,
    /// Absolute path, `/` is the root
    pub path: String,
}

impl DataPath {
    /// Build a path, normalizing a missing leading `/` and any trailing `/`
    pub fn new(kind: DatastoreKind, path: impl AsRef<str>) -> Self {
        let trimmed = path.as_ref().trim_matches('/');
        Self {
            kind,
            path: format!("/{}", trimmed),
        }
    }

    /// Child path one segment down
    pub fn child(&self, segment: &str) -> Self {
        let segment = segment.trim_matches('/');
        if self.path == "/" {
            Self::new(self.kind, segment)
        } else {
            Self::new(self.kind, format!("{}/{}", self.path, segment))
        }
    }

    /// True if `self` is `other` or one of its ancestors
    pub fn is_ancestor_of(&self, other: &DataPath) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.path == "/" || self.path == other.path {
            return true;
        }
        other
            .path
            .strip_prefix(&self.path)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DatastoreKind::Config => "config",
            DatastoreKind::Operational => "operational",
        };
        write!(f, "{}:{}", kind, self.path)
    }
}

/// One committed change to one node
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    /// Node that changed
    pub path: DataPath,
    /// Kind of change
    pub kind: ModificationKind,
    /// Value before the change
    pub before: Option<Value>,
    /// Value after the change
    pub after: Option<Value>,
}

/// Receives batches of committed changes
pub trait ChangeListener: Send + Sync {
    /// Called once per committed batch
    fn on_changes(&self, changes: Vec<DataChange>);
}

type Closer = Box<dyn FnOnce() + Send + Sync>;

/// Handle on a registered change listener. Closing or dropping it stops delivery.
pub struct ListenerRegistration {
    path: DataPath,
    closer: Option<Closer>,
}

impl ListenerRegistration {
    /// Wrap a store-specific close action
    pub fn new(path: DataPath, closer: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            path,
            closer: Some(Box::new(closer)),
        }
    }

    /// Path the listener is registered on
    pub fn path(&self) -> &DataPath {
        &self.path
    }

    /// Stop delivery
    pub fn close(mut self) {
        self.run_closer();
    }

    fn run_closer(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.run_closer();
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("path", &self.path)
            .field("open", &self.closer.is_some())
            .finish()
    }
}

/// Transactional data store collaborator
pub trait DataStore: Send + Sync {
    /// Read the value at a path in a fresh read transaction
    fn read(&self, path: &DataPath) -> StoreResult<Option<Value>>;

    /// Register for changes at or below a path
    fn register_change_listener(
        &self,
        path: &DataPath,
        listener: Arc<dyn ChangeListener>,
    ) -> StoreResult<ListenerRegistration>;
}
