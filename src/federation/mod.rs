//! # Federation
//!
//! Site-to-site state replication over a message bus.
//!
//! A consumer site subscribes to a producer site by sending `Subscribe` to the
//! producer's control queue. The producer opens a session, sends a full sync
//! of existing data followed by live changes on a per-session dynamic queue,
//! and numbers every envelope. The consumer validates the numbering with a
//! [`SequencedDeliveryGuard`] and resubscribes on any gap.
//!
//! ## Modules
//!
//! - `message`: envelope vocabulary
//! - `guard`: per-subscription order validation
//! - `plugin`: egress/ingress SPI and the factory registry
//! - `control`: control-queue demultiplexing
//! - `producer` / `consumer`: the two coordinators
//! - `leadership`: the leadership oracle both coordinators listen to
//! - `config`, `naming`, `task`, `errors`: support
//! - `mirror`: a store-mirroring plugin pair

mod config;
mod consumer;
mod control;
mod errors;
mod guard;
mod leadership;
mod message;
mod mirror;
mod naming;
mod plugin;
mod producer;
mod task;

pub use config::{FederationConfig, RemoteSiteConfig, SiteRegistry, StaticSiteRegistry};
pub use consumer::ConsumerCoordinator;
pub use control::{ControlMessage, ControlMessageConsumer};
pub use errors::{FederationError, FederationResult};
pub use guard::{DeliveryOutcome, GuardState, SequencedDeliveryGuard};
pub use leadership::{LeadershipListener, LeadershipSignal};
pub use message::{
    EntityMessage, Envelope, SubscribeMessage, UnsubscribeMessage, FIRST_SESSION_SEQUENCE,
    START_FULL_SYNC_SEQUENCE,
};
pub use mirror::{MirrorEgress, MirrorFactory, MirrorIngress, MirrorStats, MIRROR_PLUGIN_TYPE};
pub use naming::{control_queue_name, dynamic_queue_name};
pub use plugin::{
    abort_done, AbortAck, ConsumerManagement, EgressPlugin, IngressPlugin, ListenerData,
    PluginFactory, PluginRegistry,
};
pub use producer::{ProducerCoordinator, SessionPublisher};
pub use task::{await_with_deadline, DeadlineOutcome, RetryTask};
