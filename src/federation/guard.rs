//! Sequenced Delivery Guard
//!
//! Validates the envelope stream of one remote subscription before it reaches
//! the ingress plugin:
//! - The first sequenced envelope must be `StartFullSync`
//! - Every sequenced envelope must carry exactly the expected sequence id
//! - Any violation aborts the guard and asks the plugin to resubscribe, once
//! - An aborted guard drops everything until it is replaced
//!
//! The bus feeds one queue to one consumer at a time, so the guard keeps its
//! state behind `&mut self` with no locking.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::message::{Envelope, START_FULL_SYNC_SEQUENCE};
use super::plugin::IngressPlugin;
use crate::observability::{Event, FederationMetrics, Logger};
use crate::transport::EnvelopeConsumer;

/// Guard lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Nothing received yet
    AwaitingFirst,
    /// Between `StartFullSync` and `EndFullSync`
    FullSync,
    /// After `EndFullSync`
    Steady,
    /// Stream broken; terminal
    Aborted,
}

/// What the guard did with one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted and dispatched to the plugin
    Delivered,
    /// Dropped because the guard is aborted
    DroppedAborted,
    /// First envelope was not `StartFullSync`; guard aborted
    FirstNotStart,
    /// Sequence gap, duplicate or reorder; guard aborted
    Mismatch {
        /// Expected sequence id
        expected: u64,
        /// Received sequence id
        received: u64,
    },
    /// Unsequenced envelope on a data queue; ignored
    Unexpected,
}

/// Per-subscription order validator in front of an ingress plugin
pub struct SequencedDeliveryGuard {
    remote_id: String,
    plugin: Arc<dyn IngressPlugin>,
    metrics: Arc<FederationMetrics>,
    expected_next_sequence: u64,
    full_sync_started_at: Option<DateTime<Utc>>,
    full_sync_messages: u64,
    state: GuardState,
}

impl SequencedDeliveryGuard {
    /// Fresh guard awaiting `StartFullSync`
    pub fn new(
        remote_id: impl Into<String>,
        plugin: Arc<dyn IngressPlugin>,
        metrics: Arc<FederationMetrics>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            plugin,
            metrics,
            expected_next_sequence: START_FULL_SYNC_SEQUENCE,
            full_sync_started_at: None,
            full_sync_messages: 0,
            state: GuardState::AwaitingFirst,
        }
    }

    /// Current state
    pub fn state(&self) -> GuardState {
        self.state
    }

    /// True once the stream broke
    pub fn is_aborted(&self) -> bool {
        self.state == GuardState::Aborted
    }

    /// Sequence id the next envelope must carry
    pub fn expected_next_sequence(&self) -> u64 {
        self.expected_next_sequence
    }

    /// Validate one envelope and dispatch it to the plugin
    pub fn deliver(&mut self, envelope: Envelope) -> DeliveryOutcome {
        if self.state == GuardState::Aborted {
            self.metrics.increment_msg_while_aborted();
            Logger::trace(
                Event::EnvelopeWhileAborted,
                &[("remote", &self.remote_id), ("envelope", &envelope.to_string())],
            );
            return DeliveryOutcome::DroppedAborted;
        }

        if let Some(received) = envelope.sequence_id() {
            self.metrics.increment_consume_msg();

            if self.state == GuardState::AwaitingFirst
                && !matches!(envelope, Envelope::StartFullSync { .. })
            {
                Logger::error(
                    Event::FirstEnvelopeNotStart,
                    &[("remote", &self.remote_id), ("envelope", &envelope.to_string())],
                );
                self.abort();
                return DeliveryOutcome::FirstNotStart;
            }

            if received != self.expected_next_sequence {
                let expected = self.expected_next_sequence;
                self.metrics.increment_sequence_mismatch();
                Logger::error(
                    Event::SequenceMismatch,
                    &[
                        ("remote", &self.remote_id),
                        ("expected", &expected.to_string()),
                        ("received", &received.to_string()),
                    ],
                );
                self.abort();
                return DeliveryOutcome::Mismatch { expected, received };
            }

            self.expected_next_sequence = received + 1;
        }

        self.dispatch(envelope)
    }

    fn dispatch(&mut self, envelope: Envelope) -> DeliveryOutcome {
        match envelope {
            Envelope::StartFullSync { .. } => {
                self.state = GuardState::FullSync;
                self.full_sync_started_at = Some(Utc::now());
                self.full_sync_messages = 0;
                self.metrics.increment_begin_fullsync();
                Logger::info(Event::FullSyncBegin, &[("remote", &self.remote_id)]);
                self.plugin.begin_full_sync();
            }
            Envelope::EndFullSync { .. } => {
                self.metrics.increment_end_fullsync();
                let (elapsed_ms, messages) = self.full_sync_progress();
                Logger::info(
                    Event::FullSyncEnd,
                    &[
                        ("remote", &self.remote_id),
                        ("elapsed_ms", &elapsed_ms.to_string()),
                        ("messages", &messages.to_string()),
                    ],
                );
                self.state = GuardState::Steady;
                self.plugin.end_full_sync();
            }
            Envelope::FullSyncFailed { .. } => {
                self.metrics.increment_failed_fullsync();
                let (elapsed_ms, messages) = self.full_sync_progress();
                Logger::warn(
                    Event::FullSyncFailed,
                    &[
                        ("remote", &self.remote_id),
                        ("elapsed_ms", &elapsed_ms.to_string()),
                        ("messages", &messages.to_string()),
                    ],
                );
                self.plugin.full_sync_failed();
            }
            Envelope::EntityUpdate {
                sequence_id,
                entity,
            } => {
                if self.state == GuardState::FullSync {
                    self.full_sync_messages += 1;
                }
                Logger::trace(
                    Event::EnvelopeConsumed,
                    &[
                        ("remote", &self.remote_id),
                        ("sequence_id", &sequence_id.to_string()),
                    ],
                );
                self.plugin.consume_msg(entity);
            }
            other @ (Envelope::Subscribe(_) | Envelope::Unsubscribe(_)) => {
                Logger::warn(
                    Event::UnknownEnvelope,
                    &[("remote", &self.remote_id), ("envelope", &other.to_string())],
                );
                return DeliveryOutcome::Unexpected;
            }
        }
        DeliveryOutcome::Delivered
    }

    /// Milliseconds since `StartFullSync` and entities received since then
    fn full_sync_progress(&self) -> (i64, u64) {
        let elapsed_ms = self
            .full_sync_started_at
            .map(|started| (Utc::now() - started).num_milliseconds())
            .unwrap_or_default();
        (elapsed_ms, self.full_sync_messages)
    }

    fn abort(&mut self) {
        self.state = GuardState::Aborted;
        Logger::warn(Event::ResubscriptionTriggered, &[("remote", &self.remote_id)]);
        self.plugin.resubscribe();
    }
}

impl EnvelopeConsumer for SequencedDeliveryGuard {
    fn consume(&mut self, envelope: Envelope) {
        self.deliver(envelope);
    }
}
