//! Wire encodings negotiated via the `?encoding=` query parameter:
//! human-readable JSON (default) and a compact CBOR form for native
//! clients. Dispatch produces a logical payload; encoding happens last,
//! right before the socket write.

use halyard_models::gateway::GatewayMessage;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEncoding {
    Json,
    Cbor,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cbor encode failed: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

impl WireEncoding {
    pub fn from_query(raw: Option<&str>) -> Self {
        match raw {
            Some("cbor") => WireEncoding::Cbor,
            _ => WireEncoding::Json,
        }
    }

    /// Serialize one frame. The bool is whether the bytes must travel as
    /// a binary websocket message even without compression.
    pub fn encode(&self, msg: &GatewayMessage) -> Result<(Vec<u8>, bool), EncodeError> {
        match self {
            WireEncoding::Json => Ok((serde_json::to_vec(msg)?, false)),
            WireEncoding::Cbor => Ok((serde_cbor::to_vec(msg)?, true)),
        }
    }

    /// Parse one inbound client frame into a JSON value, `None` when the
    /// payload is malformed for this encoding.
    pub fn decode_text(&self, text: &str) -> Option<Value> {
        match self {
            WireEncoding::Json => serde_json::from_str(text).ok(),
            WireEncoding::Cbor => None,
        }
    }

    pub fn decode_binary(&self, data: &[u8]) -> Option<Value> {
        match self {
            WireEncoding::Json => None,
            WireEncoding::Cbor => serde_cbor::from_slice(data).ok(),
        }
    }
}
