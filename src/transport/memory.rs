//! In-process loopback broker
//!
//! Every envelope goes through the wire codec on its way in and out, so the
//! loopback exercises the same encoding a networked broker would see.
//! Delivery happens on the sending thread: the first sender to find a queue
//! idle drains it, later senders only enqueue. That keeps per-queue FIFO and
//! one `consume` call at a time, including when a consumer sends back into the
//! queue it is being fed from.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::codec::{decode_envelope, encode_envelope};
use super::{
    BrokerEndpoint, EnvelopeConsumer, HandlerTag, MessageBus, TransportError, TransportResult,
};
use crate::federation::Envelope;
use crate::observability::{Event, Logger};

type SharedConsumer = Arc<Mutex<Box<dyn EnvelopeConsumer>>>;

struct QueueState {
    broker: BrokerEndpoint,
    pending: VecDeque<Vec<u8>>,
    handler: Option<(HandlerTag, SharedConsumer)>,
    draining: bool,
}

struct Queue {
    name: String,
    state: Mutex<QueueState>,
}

/// Loopback message bus
pub struct InMemoryBus {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    available: AtomicBool,
    next_tag: AtomicU64,
    sent: Mutex<HashMap<String, Vec<Envelope>>>,
    destroyed: Mutex<Vec<String>>,
}

// A consumer that panicked must not wedge the whole bus
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryBus {
    /// Create an empty, available bus
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            next_tag: AtomicU64::new(1),
            sent: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a broker outage. While unavailable, `create_queue` fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// True if the queue is currently declared
    pub fn queue_exists(&self, name: &str) -> bool {
        lock(&self.queues).contains_key(name)
    }

    /// Every envelope accepted for a queue, in send order
    pub fn sent_log(&self, name: &str) -> Vec<Envelope> {
        lock(&self.sent).get(name).cloned().unwrap_or_default()
    }

    /// Names of destroyed queues, one entry per destruction
    pub fn destroyed_queues(&self) -> Vec<String> {
        lock(&self.destroyed).clone()
    }

    /// Number of queues with an attached handler
    pub fn handler_count(&self) -> usize {
        self.snapshot_queues()
            .iter()
            .filter(|q| lock(&q.state).handler.is_some())
            .count()
    }

    /// True if the named queue has an attached handler
    pub fn has_handler(&self, name: &str) -> bool {
        self.find(name)
            .map(|q| lock(&q.state).handler.is_some())
            .unwrap_or(false)
    }

    /// Broker endpoint a queue was declared against
    pub fn queue_broker(&self, name: &str) -> Option<BrokerEndpoint> {
        self.find(name).map(|q| lock(&q.state).broker.clone())
    }

    fn find(&self, name: &str) -> Option<Arc<Queue>> {
        lock(&self.queues).get(name).cloned()
    }

    fn snapshot_queues(&self) -> Vec<Arc<Queue>> {
        lock(&self.queues).values().cloned().collect()
    }

    fn drain(queue: &Queue) {
        {
            let mut state = lock(&queue.state);
            if state.draining || state.handler.is_none() {
                return;
            }
            state.draining = true;
        }

        loop {
            let (bytes, consumer) = {
                let mut state = lock(&queue.state);
                let consumer = match &state.handler {
                    Some((_, consumer)) if !state.pending.is_empty() => consumer.clone(),
                    _ => {
                        state.draining = false;
                        return;
                    }
                };
                match state.pending.pop_front() {
                    Some(bytes) => (bytes, consumer),
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            let envelope = match decode_envelope(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    Logger::error(
                        Event::CodecFailed,
                        &[("queue", &queue.name), ("error", &e.to_string())],
                    );
                    continue;
                }
            };

            let mut guard = lock(&consumer);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| guard.consume(envelope)));
            if outcome.is_err() {
                Logger::error(
                    Event::UnknownEnvelope,
                    &[("queue", &queue.name), ("reason", "consumer panicked")],
                );
            }
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for InMemoryBus {
    fn create_queue(&self, name: &str, broker: &BrokerEndpoint) -> TransportResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::BrokerUnavailable(broker.address()));
        }

        let mut queues = lock(&self.queues);
        if queues.contains_key(name) {
            return Ok(());
        }
        queues.insert(
            name.to_string(),
            Arc::new(Queue {
                name: name.to_string(),
                state: Mutex::new(QueueState {
                    broker: broker.clone(),
                    pending: VecDeque::new(),
                    handler: None,
                    draining: false,
                }),
            }),
        );
        drop(queues);

        Logger::trace(
            Event::QueueDeclared,
            &[("queue", name), ("broker", &broker.address())],
        );
        Ok(())
    }

    fn destroy_queue(&self, name: &str) -> TransportResult<()> {
        let queue = lock(&self.queues)
            .remove(name)
            .ok_or_else(|| TransportError::UnknownQueue(name.to_string()))?;

        {
            let mut state = lock(&queue.state);
            state.pending.clear();
            state.handler = None;
        }
        lock(&self.destroyed).push(name.to_string());

        Logger::trace(Event::QueueDeleted, &[("queue", name)]);
        Ok(())
    }

    fn attach_handler(
        &self,
        name: &str,
        consumer: Box<dyn EnvelopeConsumer>,
    ) -> TransportResult<HandlerTag> {
        let queue = self
            .find(name)
            .ok_or_else(|| TransportError::UnknownQueue(name.to_string()))?;

        let tag = HandlerTag::new(format!(
            "ctag-{}",
            self.next_tag.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut state = lock(&queue.state);
            if state.handler.is_some() {
                return Err(TransportError::HandlerBusy(name.to_string()));
            }
            state.handler = Some((tag.clone(), Arc::new(Mutex::new(consumer))));
        }

        Self::drain(&queue);
        Ok(tag)
    }

    fn detach_handler(&self, name: &str, tag: &HandlerTag) -> TransportResult<()> {
        let queue = self
            .find(name)
            .ok_or_else(|| TransportError::UnknownQueue(name.to_string()))?;

        let mut state = lock(&queue.state);
        match &state.handler {
            Some((attached, _)) if attached == tag => {
                state.handler = None;
                Ok(())
            }
            _ => Err(TransportError::UnknownHandler {
                queue: name.to_string(),
                tag: tag.to_string(),
            }),
        }
    }

    fn send(&self, envelope: &Envelope, name: &str) -> TransportResult<()> {
        let Some(queue) = self.find(name) else {
            Logger::error(
                Event::QueueUnknown,
                &[("queue", name), ("envelope", &envelope.to_string())],
            );
            return Err(TransportError::UnknownQueue(name.to_string()));
        };

        let bytes = encode_envelope(envelope)?;
        lock(&self.sent)
            .entry(name.to_string())
            .or_default()
            .push(envelope.clone());
        lock(&queue.state).pending.push_back(bytes);

        Logger::trace(
            Event::EnvelopeSent,
            &[("queue", name), ("envelope", &envelope.to_string())],
        );

        Self::drain(&queue);
        Ok(())
    }
}
