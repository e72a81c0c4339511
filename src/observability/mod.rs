//! Observability for fedsync
//!
//! - Structured logging (JSON lines) keyed by typed [`Event`]s
//! - Occurrence counters ([`FederationMetrics`])
//!
//! Observability never alters federation behavior and never fails an operation.
//!
//! ```ignore
//! use fedsync::observability::{Event, Logger};
//!
//! Logger::info(Event::SubscribeSent, &[("remote", "site-b"), ("queue", "q1")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{FederationMetrics, MetricsSnapshot};
