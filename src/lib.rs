//! fedsync - site-to-site state federation over a message bus
//!
//! A producer site streams a full sync of existing data followed by live
//! changes to each subscribed consumer site. Every envelope on a session is
//! numbered, and the consumer resubscribes on any gap.

pub mod cli;
pub mod federation;
pub mod observability;
pub mod store;
pub mod transport;
