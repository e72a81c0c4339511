//! Envelope wire codec
//!
//! Envelopes travel as JSON objects tagged by `type`. Unknown fields are
//! ignored so a newer producer can talk to an older consumer.

use super::{TransportError, TransportResult};
use crate::federation::Envelope;

/// Encode an envelope to wire bytes
pub fn encode_envelope(envelope: &Envelope) -> TransportResult<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Decode wire bytes into an envelope
pub fn decode_envelope(bytes: &[u8]) -> TransportResult<Envelope> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::{EntityMessage, SubscribeMessage};
    use crate::store::{DatastoreKind, ModificationKind};
    use serde_json::{json, Value};

    #[test]
    fn test_wire_shape_is_tagged() {
        let bytes = encode_envelope(&Envelope::end_full_sync(12)).unwrap();
        let wire: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(wire["type"], "end_full_sync");
        assert_eq!(wire["sequence_id"], 12);
    }

    #[test]
    fn test_entity_update_survives_the_wire() {
        let entity = EntityMessage::encode_tagged(
            DatastoreKind::Operational,
            ModificationKind::Delete,
            &json!({"id": 3}),
            "flow",
        )
        .unwrap()
        .with_metadata("/flows/3");
        let envelope = Envelope::entity_update(9, entity);

        let decoded = decode_envelope(&encode_envelope(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_subscribe_optional_fields_default() {
        let decoded = decode_envelope(
            br#"{"type":"subscribe","dynamic_queue_name":"q","plugin_type":"mirror",
                 "subscriber_id":"a","context_id":"a"}"#,
        )
        .unwrap();

        match decoded {
            Envelope::Subscribe(SubscribeMessage {
                payload,
                request_mutual_subscription,
                ..
            }) => {
                assert!(payload.is_none());
                assert!(!request_mutual_subscription);
            }
            other => panic!("unexpected envelope {other}"),
        }
    }

    #[test]
    fn test_garbage_is_codec_error() {
        let err = decode_envelope(b"\x00not json").unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));

        let err = decode_envelope(br#"{"type":"teleport","sequence_id":1}"#).unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }
}
