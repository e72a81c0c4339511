//! # Federation Errors
//!
//! Error types for the federation core.
//!
//! Coordinators log every failure where it happens. The returned error only
//! tells the caller why an operation had no effect; it never has to be acted on
//! for the federation to stay consistent.

use thiserror::Error;

use crate::store::StoreError;
use crate::transport::TransportError;

/// Result type for federation operations
pub type FederationResult<T> = Result<T, FederationError>;

/// Federation errors
#[derive(Debug, Clone, Error)]
pub enum FederationError {
    // ==================
    // Configuration absent
    // ==================
    /// Subscribe for a plugin type that has no factory
    #[error("No plugin factory registered for type: {0}")]
    UnknownPluginType(String),

    /// Remote site is not in the site registry
    #[error("Remote site not configured: {0}")]
    UnknownRemoteSite(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    // ==================
    // Leadership / lifecycle
    // ==================
    /// Operation requires federation leadership
    #[error("Operation requires federation leadership")]
    NotLeader,

    /// Service configured not to start
    #[error("Federation service is configured not to start")]
    ServiceDisabled,

    // ==================
    // Sessions and subscriptions
    // ==================
    /// No producer session for a context id
    #[error("No producer session for context: {0}")]
    SessionNotFound(String),

    /// No consumer subscription for a remote site
    #[error("No subscription for remote site: {0}")]
    SubscriptionNotFound(String),

    /// Plugin factory refused to create an egress plugin
    #[error("Plugin factory failed: {0}")]
    PluginFactory(String),

    // ==================
    // Data path
    // ==================
    /// A queue could not be declared
    #[error("Queue creation failed: {0}")]
    QueueCreation(String),

    /// Reading existing data during full sync failed
    #[error("Full sync read failed: {0}")]
    FullSyncRead(String),

    /// Entity encode/decode failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Transport collaborator failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Data store collaborator failed
    #[error(transparent)]
    Store(#[from] StoreError),

    // ==================
    // Internal
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FederationError {
    /// Lock poisoned while mutating coordinator state.
    pub(crate) fn poisoned() -> Self {
        FederationError::Internal("Lock poisoned".into())
    }

    /// True for errors caused by missing configuration rather than a runtime fault.
    pub fn is_configuration_absent(&self) -> bool {
        matches!(
            self,
            FederationError::UnknownPluginType(_)
                | FederationError::UnknownRemoteSite(_)
                | FederationError::Config(_)
        )
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(err: serde_json::Error) -> Self {
        FederationError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_absent() {
        assert!(FederationError::UnknownPluginType("mirror".into()).is_configuration_absent());
        assert!(FederationError::UnknownRemoteSite("site-b".into()).is_configuration_absent());
        assert!(!FederationError::NotLeader.is_configuration_absent());
        assert!(!FederationError::FullSyncRead("boom".into()).is_configuration_absent());
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err: FederationError = TransportError::UnknownQueue("q1".into()).into();
        assert_eq!(err.to_string(), "Unknown queue: q1");
    }
}
