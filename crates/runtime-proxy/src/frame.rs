//! Payload framing between proxied sockets and windows.
//!
//! Windows exchange payloads as JSON. Kernel traffic is mostly JSON text, but
//! binary frames (kernel message buffers) must survive the trip losslessly,
//! so they travel as a tagged byte array:
//!
//! ```json
//! { "type": "Buffer", "data": [104, 105] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// Tag of a byte-array envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferKind {
    Buffer,
    ArrayBuffer,
}

/// A binary payload encoded as a JSON byte array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferEnvelope {
    #[serde(rename = "type")]
    pub kind: BufferKind,
    pub data: Vec<u8>,
}

impl BufferEnvelope {
    pub fn buffer(data: Vec<u8>) -> Self {
        Self {
            kind: BufferKind::Buffer,
            data,
        }
    }

    /// Interpret a JSON value as an envelope, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// A payload delivered to a window in a `message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyPayload {
    /// A frame whose bytes are UTF-8 JSON, forwarded verbatim as a string.
    Text(String),
    /// Anything else, forwarded as a byte array.
    Binary(BufferEnvelope),
}

impl ProxyPayload {
    /// Reconstruct the original frame bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ProxyPayload::Text(text) => text.into_bytes(),
            ProxyPayload::Binary(envelope) => envelope.data,
        }
    }
}

/// Classify incoming frame bytes for delivery to a window.
///
/// Text and binary frames are treated alike: UTF-8 that parses as JSON
/// becomes a string, everything else becomes a `Buffer` envelope.
pub fn decode_incoming(bytes: &[u8]) -> ProxyPayload {
    if let Ok(text) = std::str::from_utf8(bytes) {
        if serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok() {
            return ProxyPayload::Text(text.to_string());
        }
    }
    ProxyPayload::Binary(BufferEnvelope::buffer(bytes.to_vec()))
}

/// Build the outgoing socket frame for data sent by a window.
///
/// Envelopes become binary frames, strings are sent as-is, and any other
/// JSON value is stringified.
pub fn encode_outgoing(data: &Value) -> Message {
    if let Some(envelope) = BufferEnvelope::from_value(data) {
        return Message::Binary(envelope.data);
    }
    match data {
        Value::String(text) => Message::Text(text.clone()),
        other => Message::Text(serde_json::to_string(other).unwrap_or_else(|_| other.to_string())),
    }
}
