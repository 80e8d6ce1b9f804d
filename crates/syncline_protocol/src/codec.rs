//! CBOR encoding of batches.
//!
//! Both directions are wrapped in a versioned envelope so a peer speaking
//! another protocol version is rejected instead of misread.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{BatchReply, OutgoingMessage};
use crate::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};

/// One outbound batch as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Protocol version of the sender.
    pub version: u16,
    /// Messages in drain order.
    pub messages: Vec<OutgoingMessage>,
}

impl BatchRequest {
    /// Creates a request at the current protocol version.
    pub fn new(messages: Vec<OutgoingMessage>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            messages,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ReplyEnvelope {
    version: u16,
    reply: BatchReply,
}

fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| ProtocolError::encoding(e.to_string()))?;
    Ok(bytes)
}

fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding(e.to_string()))
}

fn check_version(remote: u16) -> ProtocolResult<()> {
    if remote != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote,
        });
    }
    Ok(())
}

/// Encodes an outbound batch.
pub fn encode_request(messages: &[OutgoingMessage]) -> ProtocolResult<Vec<u8>> {
    to_cbor(&BatchRequest::new(messages.to_vec()))
}

/// Decodes an outbound batch, checking the protocol version.
pub fn decode_request(bytes: &[u8]) -> ProtocolResult<BatchRequest> {
    let request: BatchRequest = from_cbor(bytes)?;
    check_version(request.version)?;
    Ok(request)
}

/// Encodes a batch reply.
pub fn encode_reply(reply: &BatchReply) -> ProtocolResult<Vec<u8>> {
    to_cbor(&ReplyEnvelope {
        version: PROTOCOL_VERSION,
        reply: reply.clone(),
    })
}

/// Decodes a batch reply, checking the protocol version.
pub fn decode_reply(bytes: &[u8]) -> ProtocolResult<BatchReply> {
    let envelope: ReplyEnvelope = from_cbor(bytes)?;
    check_version(envelope.version)?;
    Ok(envelope.reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Delta, EntityType, FieldChange};
    use crate::message::ResponseMessage;
    use proptest::prelude::*;

    const TASK: EntityType = EntityType::new(1);

    #[test]
    fn request_survives_the_wire() {
        let messages = vec![
            OutgoingMessage::ChangesHappened {
                entity_type: TASK,
                entity_id: 42,
                outstanding: Delta::from_changes(vec![FieldChange::set("title", "x", 3)]),
            },
            OutgoingMessage::BriefMe {
                entity_type: TASK,
                last_synced: 1_700_000_000_000,
            },
        ];
        let bytes = encode_request(&messages).unwrap();
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.messages, messages);
    }

    #[test]
    fn reply_keeps_completion_flag() {
        let reply = BatchReply::partial(vec![ResponseMessage::Watermark {
            entity_type: TASK,
            timestamp: 5,
        }]);
        let decoded = decode_reply(&encode_reply(&reply).unwrap()).unwrap();
        assert_eq!(decoded, reply);
        assert!(!decoded.complete);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let request = BatchRequest {
            version: PROTOCOL_VERSION + 1,
            messages: Vec::new(),
        };
        let bytes = to_cbor(&request).unwrap();
        let err = decode_request(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
    }

    #[test]
    fn garbage_is_a_decoding_error() {
        let err = decode_reply(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, ProtocolError::DecodingFailed { .. }));
    }

    proptest! {
        #[test]
        fn decoding_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_request(&bytes);
            let _ = decode_reply(&bytes);
        }
    }
}
