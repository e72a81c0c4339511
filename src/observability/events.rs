//! Observable events for fedsync
//!
//! Every log line is keyed by one of these events. Events are explicit and typed.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Coordinator started
    ServiceStart,
    /// Coordinator shut down
    ServiceStop,
    /// Service configured not to start
    ServiceDisabled,
    /// Configuration loaded
    ConfigLoaded,

    // Leadership
    /// This node became the federation leader
    LeadershipGained,
    /// This node lost federation leadership
    LeadershipLost,
    /// Operation refused because this node is not the leader
    NotLeader,

    // Control queue
    /// Local control queue declared
    ControlQueueCreated,
    /// Local control queue could not be declared
    ControlQueueCreateFailed,
    /// Control handler attached to the control queue
    ControlHandlerAttached,
    /// Control handler detached from the control queue
    ControlHandlerDetached,
    /// Local control queue destroyed
    ControlQueueDestroyed,
    /// Control envelope received
    ControlMessageReceived,

    // Plugin registry
    /// Plugin factory attached
    PluginFactoryAttached,
    /// Plugin factory detached
    PluginFactoryDetached,
    /// Subscribe for a plugin type with no factory
    UnknownPluginType,
    /// Plugin factory refused to create a session plugin
    PluginFactoryFailed,

    // Producer sessions
    /// Producer session created
    SessionCreated,
    /// Producer session torn down
    SessionTornDown,
    /// No session exists for a context id
    SessionNotFound,
    /// Plugin did not acknowledge abort before the deadline
    PluginAbortTimeout,
    /// Live-change listener registered
    ListenerRegistered,
    /// Live-change listener closed
    ListenerClosed,
    /// Live-change listener registration failed
    ListenerRegisterFailed,
    /// StartFullSync sent
    FullSyncStartSent,
    /// EndFullSync sent
    FullSyncEndSent,
    /// FullSyncFailed sent
    FullSyncFailedSent,
    /// Reading existing data for full sync failed
    FullSyncReadFailed,
    /// Entity published on a session
    MessagePublished,
    /// Publishing an entity failed
    PublishFailed,
    /// Mutual subscription requested by the subscriber
    MutualSubscriptionTriggered,

    // Queues
    /// Dynamic queue declared
    DynamicQueueCreated,
    /// Dynamic queue destroyed
    DynamicQueueDestroyed,
    /// Dynamic queue destruction failed
    DynamicQueueDestroyFailed,
    /// Queue declaration failed
    QueueCreateFailed,
    /// Delivery guard could not be attached to a dynamic queue
    GuardAttachFailed,

    // Consumer subscriptions
    /// Remote site not present in the site registry
    RemoteSiteUnknown,
    /// Remote control queue declared
    RemoteControlQueueCreated,
    /// Subscribe envelope sent
    SubscribeSent,
    /// Subscribe envelope could not be sent
    SubscribeSendFailed,
    /// Unsubscribe envelope sent
    UnsubscribeSent,
    /// No subscription exists for a remote site
    SubscriptionNotFound,
    /// Plugin resubscription triggered
    ResubscriptionTriggered,

    // Delivery guard
    /// Sequenced envelope accepted
    EnvelopeConsumed,
    /// Envelope dropped because the guard is aborted
    EnvelopeWhileAborted,
    /// First envelope was not StartFullSync
    FirstEnvelopeNotStart,
    /// Sequence gap, duplicate or reorder detected
    SequenceMismatch,
    /// Full sync began
    FullSyncBegin,
    /// Full sync ended
    FullSyncEnd,
    /// Full sync reported failed by the producer
    FullSyncFailed,
    /// Envelope of an unexpected variant
    UnknownEnvelope,

    // Transport
    /// Queue declared on the broker
    QueueDeclared,
    /// Queue deleted on the broker
    QueueDeleted,
    /// Send to a queue that was never declared
    QueueUnknown,
    /// Envelope could not be encoded or decoded
    CodecFailed,
    /// Envelope sent
    EnvelopeSent,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ServiceStart => "SERVICE_START",
            Event::ServiceStop => "SERVICE_STOP",
            Event::ServiceDisabled => "SERVICE_DISABLED",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::LeadershipGained => "LEADERSHIP_GAINED",
            Event::LeadershipLost => "LEADERSHIP_LOST",
            Event::NotLeader => "NOT_LEADER",

            Event::ControlQueueCreated => "CONTROL_QUEUE_CREATED",
            Event::ControlQueueCreateFailed => "CONTROL_QUEUE_CREATE_FAILED",
            Event::ControlHandlerAttached => "CONTROL_HANDLER_ATTACHED",
            Event::ControlHandlerDetached => "CONTROL_HANDLER_DETACHED",
            Event::ControlQueueDestroyed => "CONTROL_QUEUE_DESTROYED",
            Event::ControlMessageReceived => "CONTROL_MESSAGE_RECEIVED",

            Event::PluginFactoryAttached => "PLUGIN_FACTORY_ATTACHED",
            Event::PluginFactoryDetached => "PLUGIN_FACTORY_DETACHED",
            Event::UnknownPluginType => "UNKNOWN_PLUGIN_TYPE",
            Event::PluginFactoryFailed => "PLUGIN_FACTORY_FAILED",

            Event::SessionCreated => "SESSION_CREATED",
            Event::SessionTornDown => "SESSION_TORN_DOWN",
            Event::SessionNotFound => "SESSION_NOT_FOUND",
            Event::PluginAbortTimeout => "PLUGIN_ABORT_TIMEOUT",
            Event::ListenerRegistered => "LISTENER_REGISTERED",
            Event::ListenerClosed => "LISTENER_CLOSED",
            Event::ListenerRegisterFailed => "LISTENER_REGISTER_FAILED",
            Event::FullSyncStartSent => "FULL_SYNC_START_SENT",
            Event::FullSyncEndSent => "FULL_SYNC_END_SENT",
            Event::FullSyncFailedSent => "FULL_SYNC_FAILED_SENT",
            Event::FullSyncReadFailed => "FULL_SYNC_READ_FAILED",
            Event::MessagePublished => "MESSAGE_PUBLISHED",
            Event::PublishFailed => "PUBLISH_FAILED",
            Event::MutualSubscriptionTriggered => "MUTUAL_SUBSCRIPTION_TRIGGERED",

            Event::DynamicQueueCreated => "DYNAMIC_QUEUE_CREATED",
            Event::DynamicQueueDestroyed => "DYNAMIC_QUEUE_DESTROYED",
            Event::DynamicQueueDestroyFailed => "DYNAMIC_QUEUE_DESTROY_FAILED",
            Event::QueueCreateFailed => "QUEUE_CREATE_FAILED",
            Event::GuardAttachFailed => "GUARD_ATTACH_FAILED",

            Event::RemoteSiteUnknown => "REMOTE_SITE_UNKNOWN",
            Event::RemoteControlQueueCreated => "REMOTE_CONTROL_QUEUE_CREATED",
            Event::SubscribeSent => "SUBSCRIBE_SENT",
            Event::SubscribeSendFailed => "SUBSCRIBE_SEND_FAILED",
            Event::UnsubscribeSent => "UNSUBSCRIBE_SENT",
            Event::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            Event::ResubscriptionTriggered => "RESUBSCRIPTION_TRIGGERED",

            Event::EnvelopeConsumed => "ENVELOPE_CONSUMED",
            Event::EnvelopeWhileAborted => "ENVELOPE_WHILE_ABORTED",
            Event::FirstEnvelopeNotStart => "FIRST_ENVELOPE_NOT_START",
            Event::SequenceMismatch => "SEQUENCE_MISMATCH",
            Event::FullSyncBegin => "FULL_SYNC_BEGIN",
            Event::FullSyncEnd => "FULL_SYNC_END",
            Event::FullSyncFailed => "FULL_SYNC_FAILED",
            Event::UnknownEnvelope => "UNKNOWN_ENVELOPE",

            Event::QueueDeclared => "QUEUE_DECLARED",
            Event::QueueDeleted => "QUEUE_DELETED",
            Event::QueueUnknown => "QUEUE_UNKNOWN",
            Event::CodecFailed => "CODEC_FAILED",
            Event::EnvelopeSent => "ENVELOPE_SENT",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
