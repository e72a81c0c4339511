//! Federation occurrence counters
//!
//! - Counters only, monotonic
//! - One registry per federation instance, shared by `Arc`
//! - Relaxed atomics: counts are exact, cross-counter ordering is not

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($( $(#[$doc:meta])* $name:ident => $inc:ident ),* $(,)?) => {
        /// Registry of federation occurrence counters
        #[derive(Debug, Default)]
        pub struct FederationMetrics {
            $( $(#[$doc])* $name: AtomicU64, )*
        }

        impl FederationMetrics {
            $(
                $(#[$doc])*
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Point-in-time copy of every counter
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $( $name: self.$name.load(Ordering::Relaxed), )*
                }
            }
        }

        /// A point-in-time snapshot of all counters
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct MetricsSnapshot {
            $( pub $name: u64, )*
        }
    };
}

counters! {
    /// Sequence gap, duplicate or reorder detected by a guard
    sequence_mismatch => increment_sequence_mismatch,
    /// StartFullSync handled by a guard
    begin_fullsync => increment_begin_fullsync,
    /// EndFullSync handled by a guard
    end_fullsync => increment_end_fullsync,
    /// FullSyncFailed handled by a guard
    failed_fullsync => increment_failed_fullsync,
    /// Sequenced envelope inspected by a guard
    consume_msg => increment_consume_msg,
    /// Envelope dropped by an aborted guard
    msg_while_aborted => increment_msg_while_aborted,
    /// Dynamic queue declared by the consumer side
    dynamic_queue_created => increment_dynamic_queue_created,
    /// Dynamic queue destroyed by the consumer side
    dynamic_queue_destroyed => increment_dynamic_queue_destroyed,
    /// Remote control queue declared
    remote_control_queue_created => increment_remote_control_queue_created,
    /// Subscribe envelope sent
    subscription_message_sent => increment_subscription_message_sent,
    /// Unsubscribe envelope sent
    unsubscription_message_sent => increment_unsubscription_message_sent,
    /// Data change notification batch received by a producer listener
    dcn => increment_dcn,
    /// Entity published on a producer session
    msg_published => increment_msg_published,
    /// StartFullSync sent
    start_full_sync_msg_sent => increment_start_full_sync_msg_sent,
    /// EndFullSync sent
    end_full_sync_msg_sent => increment_end_full_sync_msg_sent,
    /// FullSyncFailed sent
    full_sync_failed_msg_sent => increment_full_sync_failed_msg_sent,
}

impl FederationMetrics {
    /// Create a registry with every counter at zero
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_registry_is_zeroed() {
        let metrics = FederationMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_increments_are_counted() {
        let metrics = FederationMetrics::new();
        metrics.increment_sequence_mismatch();
        metrics.increment_msg_published();
        metrics.increment_msg_published();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sequence_mismatch, 1);
        assert_eq!(snapshot.msg_published, 2);
        assert_eq!(snapshot.dcn, 0);
    }

    #[test]
    fn test_snapshot_serializes_by_counter_name() {
        let metrics = FederationMetrics::new();
        metrics.increment_begin_fullsync();

        let parsed = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(parsed["begin_fullsync"], 1);
        assert_eq!(parsed["end_fullsync"], 0);
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(FederationMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..250 {
                        m.increment_consume_msg();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.snapshot().consume_msg, 2000);
    }
}
