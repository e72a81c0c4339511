//! # Message Envelopes
//!
//! Wire vocabulary exchanged between sites.
//!
//! `Subscribe` and `Unsubscribe` travel on control queues and carry no
//! sequence number. Every other variant travels on a dynamic queue and is
//! sequenced: `StartFullSync` is always 0, and each later envelope of the same
//! session is exactly one greater than the previous one.

use std::any::type_name;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::FederationResult;
use crate::store::{DatastoreKind, ModificationKind};

/// Sequence id carried by `StartFullSync`
pub const START_FULL_SYNC_SEQUENCE: u64 = 0;

/// First sequence id handed out by a producer session after `StartFullSync`
pub const FIRST_SESSION_SEQUENCE: u64 = 1;

/// Request to open a producer session on a remote site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeMessage {
    /// Queue the producer must publish this session on
    pub dynamic_queue_name: String,
    /// Plugin type the producer must create an egress plugin for
    pub plugin_type: String,
    /// Opaque plugin payload
    #[serde(default)]
    pub payload: Option<Value>,
    /// Site id of the subscriber
    pub subscriber_id: String,
    /// Identity of the consumer; one producer session per context id
    pub context_id: String,
    /// Ask the producer site to subscribe back to the subscriber
    #[serde(default)]
    pub request_mutual_subscription: bool,
}

/// Request to close a producer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeMessage {
    /// Dynamic queue of the session being closed
    pub dynamic_queue_name: String,
    /// Plugin type of the session being closed
    pub plugin_type: String,
    /// Identity of the consumer
    pub context_id: String,
    /// Opaque plugin payload
    #[serde(default)]
    pub payload: Option<Value>,
}

/// A domain entity carried on a dynamic queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMessage {
    /// Datastore the entity belongs to
    pub data_store_kind: DatastoreKind,
    /// How the entity changed
    pub modification_kind: ModificationKind,
    /// Free-form plugin metadata
    #[serde(default)]
    pub metadata: Option<String>,
    /// Site or component the change originated from
    #[serde(default)]
    pub originator: Option<String>,
    /// JSON text of the entity
    pub serialized_entity: String,
    /// Tag identifying the concrete entity type
    pub entity_type_tag: String,
}

impl EntityMessage {
    /// Encode an entity, tagging it with its Rust type name
    pub fn encode<T: Serialize>(
        data_store_kind: DatastoreKind,
        modification_kind: ModificationKind,
        entity: &T,
    ) -> FederationResult<Self> {
        Self::encode_tagged(data_store_kind, modification_kind, entity, type_name::<T>())
    }

    /// Encode an entity with an explicit type tag
    pub fn encode_tagged<T: Serialize>(
        data_store_kind: DatastoreKind,
        modification_kind: ModificationKind,
        entity: &T,
        entity_type_tag: impl Into<String>,
    ) -> FederationResult<Self> {
        Ok(Self {
            data_store_kind,
            modification_kind,
            metadata: None,
            originator: None,
            serialized_entity: serde_json::to_string(entity)?,
            entity_type_tag: entity_type_tag.into(),
        })
    }

    /// Attach plugin metadata
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Attach the originator
    pub fn with_originator(mut self, originator: impl Into<String>) -> Self {
        self.originator = Some(originator.into());
        self
    }

    /// Decode the entity into a concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> FederationResult<T> {
        Ok(serde_json::from_str(&self.serialized_entity)?)
    }

    /// Decode the entity as untyped JSON
    pub fn decode_value(&self) -> FederationResult<Value> {
        self.decode()
    }
}

/// Every message exchanged between sites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Open a producer session
    Subscribe(SubscribeMessage),
    /// Close a producer session
    Unsubscribe(UnsubscribeMessage),
    /// Full sync begins
    StartFullSync {
        /// Always [`START_FULL_SYNC_SEQUENCE`]
        sequence_id: u64,
    },
    /// Full sync completed
    EndFullSync {
        /// Sequence id
        sequence_id: u64,
    },
    /// Full sync aborted by the producer
    FullSyncFailed {
        /// Sequence id
        sequence_id: u64,
    },
    /// One entity, during full sync or steady sync
    EntityUpdate {
        /// Sequence id
        sequence_id: u64,
        /// The entity
        entity: EntityMessage,
    },
}

impl Envelope {
    /// `StartFullSync` with the reserved sequence id
    pub fn start_full_sync() -> Self {
        Envelope::StartFullSync {
            sequence_id: START_FULL_SYNC_SEQUENCE,
        }
    }

    /// `EndFullSync`
    pub fn end_full_sync(sequence_id: u64) -> Self {
        Envelope::EndFullSync { sequence_id }
    }

    /// `FullSyncFailed`
    pub fn full_sync_failed(sequence_id: u64) -> Self {
        Envelope::FullSyncFailed { sequence_id }
    }

    /// `EntityUpdate`
    pub fn entity_update(sequence_id: u64, entity: EntityMessage) -> Self {
        Envelope::EntityUpdate {
            sequence_id,
            entity,
        }
    }

    /// Sequence id, `None` for control envelopes
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            Envelope::Subscribe(_) | Envelope::Unsubscribe(_) => None,
            Envelope::StartFullSync { sequence_id }
            | Envelope::EndFullSync { sequence_id }
            | Envelope::FullSyncFailed { sequence_id }
            | Envelope::EntityUpdate { sequence_id, .. } => Some(*sequence_id),
        }
    }

    /// True for envelopes that take part in gap detection
    pub fn is_sequenced(&self) -> bool {
        self.sequence_id().is_some()
    }

    /// Variant name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Subscribe(_) => "Subscribe",
            Envelope::Unsubscribe(_) => "Unsubscribe",
            Envelope::StartFullSync { .. } => "StartFullSync",
            Envelope::EndFullSync { .. } => "EndFullSync",
            Envelope::FullSyncFailed { .. } => "FullSyncFailed",
            Envelope::EntityUpdate { .. } => "EntityUpdate",
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Subscribe(msg) => write!(
                f,
                "Subscribe[queue={}, plugin={}, context={}, mutual={}]",
                msg.dynamic_queue_name,
                msg.plugin_type,
                msg.context_id,
                msg.request_mutual_subscription
            ),
            Envelope::Unsubscribe(msg) => write!(
                f,
                "Unsubscribe[queue={}, plugin={}, context={}]",
                msg.dynamic_queue_name, msg.plugin_type, msg.context_id
            ),
            Envelope::EntityUpdate {
                sequence_id,
                entity,
            } => write!(
                f,
                "EntityUpdate[seq={}, type={}, modification={:?}]",
                sequence_id, entity.entity_type_tag, entity.modification_kind
            ),
            other => write!(
                f,
                "{}[seq={}]",
                other.kind(),
                other.sequence_id().unwrap_or_default()
            ),
        }
    }
}
