//! JSON frame codec for the eval link control channel.
//!
//! Decoding never panics and never fails the session: callers get a
//! [`DecodeError`] to log, and frames with an unrecognised `type` come back
//! as [`Frame::Ignored`] so newer orchestrators can add message kinds.

use serde::Serialize;
use serde_json::Value;

use crate::error::DecodeError;
use crate::link_proto::rpc::{Envelope, InboundMessage};

/// Maximum accepted frame size: 16 MB.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The orchestrator assigned this session a peer id.
    Handshake { plugin_id: String },
    /// A control message for the dispatcher.
    Message(InboundMessage),
    /// A well-formed frame with a `type` this build does not understand.
    Ignored { kind: String },
}

/// Serialize an outbound envelope to its text-frame form.
pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Parse a raw frame into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope<Frame>, DecodeError> {
    let raw: Envelope<Value> = serde_json::from_slice(bytes)?;
    decode_envelope(raw)
}

/// Classify an already-parsed envelope.
pub fn decode_envelope(raw: Envelope<Value>) -> Result<Envelope<Frame>, DecodeError> {
    let frame = classify(raw.data)?;
    Ok(Envelope {
        id: raw.id,
        for_peer: raw.for_peer,
        init: raw.init,
        data: frame,
    })
}

fn classify(data: Value) -> Result<Frame, DecodeError> {
    if let Some(plugin_id) = data.get("pluginId").and_then(Value::as_str) {
        return Ok(Frame::Handshake {
            plugin_id: plugin_id.to_string(),
        });
    }

    let kind = data
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    if !InboundMessage::KNOWN_TYPES.contains(&kind.as_str()) {
        return Ok(Frame::Ignored { kind });
    }

    serde_json::from_value(data)
        .map(Frame::Message)
        .map_err(|source| DecodeError::InvalidMessage { kind, source })
}
