//! Control queue dispatch
//!
//! The control-queue handler only decodes and forwards. Subscribe handling
//! awaits plugin aborts and runs whole full syncs, so it happens on a worker
//! task draining this channel rather than on the delivery thread.

use tokio::sync::mpsc::UnboundedSender;

use super::message::{Envelope, SubscribeMessage, UnsubscribeMessage};
use crate::observability::{Event, Logger};
use crate::transport::EnvelopeConsumer;

/// Control-plane request addressed to the producer coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Open or replace a session
    Subscribe(SubscribeMessage),
    /// Close a session
    Unsubscribe(UnsubscribeMessage),
}

impl ControlMessage {
    /// Demultiplex an envelope; data-plane variants yield `None`
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        match envelope {
            Envelope::Subscribe(msg) => Some(ControlMessage::Subscribe(msg)),
            Envelope::Unsubscribe(msg) => Some(ControlMessage::Unsubscribe(msg)),
            _ => None,
        }
    }

    /// Context id the request is about
    pub fn context_id(&self) -> &str {
        match self {
            ControlMessage::Subscribe(msg) => &msg.context_id,
            ControlMessage::Unsubscribe(msg) => &msg.context_id,
        }
    }
}

/// Handler attached to this site's control queue
pub struct ControlMessageConsumer {
    sender: UnboundedSender<ControlMessage>,
}

impl ControlMessageConsumer {
    /// Forward control messages into `sender`
    pub fn new(sender: UnboundedSender<ControlMessage>) -> Self {
        Self { sender }
    }
}

impl EnvelopeConsumer for ControlMessageConsumer {
    fn consume(&mut self, envelope: Envelope) {
        let description = envelope.to_string();
        let Some(message) = ControlMessage::from_envelope(envelope) else {
            Logger::warn(Event::UnknownEnvelope, &[("envelope", &description)]);
            return;
        };

        Logger::info(
            Event::ControlMessageReceived,
            &[("envelope", &description), ("context_id", message.context_id())],
        );
        if self.sender.send(message).is_err() {
            // Worker gone: leadership was lost while the message was in flight
            Logger::warn(
                Event::ControlHandlerDetached,
                &[("dropped", &description)],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn unsubscribe() -> Envelope {
        Envelope::Unsubscribe(UnsubscribeMessage {
            dynamic_queue_name: "q".into(),
            plugin_type: "mirror".into(),
            context_id: "site-a".into(),
            payload: None,
        })
    }

    #[test]
    fn test_forwards_control_envelopes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut consumer = ControlMessageConsumer::new(tx);

        consumer.consume(unsubscribe());

        let message = rx.try_recv().unwrap();
        assert_eq!(message.context_id(), "site-a");
        assert!(matches!(message, ControlMessage::Unsubscribe(_)));
    }

    #[test]
    fn test_ignores_data_envelopes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut consumer = ControlMessageConsumer::new(tx);

        consumer.consume(Envelope::start_full_sync());
        consumer.consume(Envelope::end_full_sync(1));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut consumer = ControlMessageConsumer::new(tx);

        consumer.consume(unsubscribe());
    }
}
