//! Wire types shared by the JSON-RPC transport, the HTTP bridge and the gateway.
//!
//! Requests follow the `{method, params, id}` convention and responses
//! `{result, error, id}`. The HTTP envelopes are a superset carrying an
//! optional target service and address override.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code used when a request body cannot be decoded.
pub const DECODE_ERROR: &str = "400";
/// Error code used when a gateway has no backend for the requested service.
pub const NOT_FOUND: &str = "404";
/// Error code used to wrap generic transport failures.
pub const TRANSPORT_ERROR: &str = "500";

/// Message reported when the gateway cannot resolve a service name.
pub const SERVICE_NOT_FOUND: &str = "Service Not Found";

/// Structured error raised by a handler and relayed end-to-end.
///
/// The text encoding is the compact JSON of the value, so an `RpcError`
/// survives any layer that only carries plain string errors and can be
/// recovered with [`RpcError::from_text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl RpcError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    /// Serialize to the literal text carried over string-only error channels.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }

    /// Attempt to recover a structured error from its text encoding.
    ///
    /// Returns `None` for any string that is not a JSON object with both
    /// `code` and `message` present.
    pub fn from_text(text: &str) -> Option<Self> {
        serde_json::from_str(text.trim()).ok()
    }

    /// Wrap a generic failure that carries no structure of its own.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(TRANSPORT_ERROR, message, Value::Null)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl std::error::Error for RpcError {}

/// Error slot of a JSON-RPC response.
///
/// Servers emit `Structured` for application errors and `Message` for
/// protocol-level failures. Peers that only speak string errors may still
/// send the text encoding of an [`RpcError`] as a `Message`, which is why
/// consumers go through [`WireError::into_structured`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireError {
    Structured(RpcError),
    Message(String),
    /// Any other shape, e.g. a numeric-code error from a foreign peer
    Other(Value),
}

impl WireError {
    /// Decode into a structured error, reparsing string errors when possible.
    pub fn into_structured(self) -> Result<RpcError, String> {
        match self {
            WireError::Structured(err) => Ok(err),
            WireError::Message(text) => RpcError::from_text(&text).ok_or(text),
            WireError::Other(value) => Err(value.to_string()),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Structured(err) => fmt::Display::fmt(err, f),
            WireError::Message(text) => f.write_str(text),
            WireError::Other(value) => fmt::Display::fmt(value, f),
        }
    }
}

/// JSON-RPC request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// `Service.Method` to invoke
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

/// JSON-RPC response object. `result` and `error` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<WireError>,
    #[serde(default)]
    pub id: Value,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            result,
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: WireError) -> Self {
        Self {
            result: Value::Null,
            error: Some(error),
            id,
        }
    }

    /// Response for a line that could not be decoded as a request.
    ///
    /// `id` is whatever [`request_id`] recovered from the line.
    pub fn parse_error(id: Value, details: impl fmt::Display) -> Self {
        Self::failure(
            id,
            WireError::Message(format!("rpc: parse error: {}", details)),
        )
    }
}

/// HTTP call envelope accepted by servers and gateways.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Target service name (only consulted by a gateway)
    #[serde(default)]
    pub service: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: i64,
    /// Explicit backend address; takes precedence over any registry lookup
    #[serde(default)]
    pub address: Option<String>,
}

/// Failure to decode a [`CallEnvelope`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EnvelopeDecodeError {
    pub message: String,
    /// Request id recovered from the body, or zero
    pub id: i64,
}

impl CallEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeDecodeError> {
        serde_json::from_slice(body).map_err(|e| EnvelopeDecodeError {
            message: e.to_string(),
            id: salvage_id(body),
        })
    }

    pub fn address_override(&self) -> Option<&str> {
        self.address.as_deref().filter(|a| !a.is_empty())
    }

    pub fn service_name(&self) -> &str {
        self.service.as_deref().unwrap_or_default()
    }
}

fn raw_id(body: &[u8]) -> Option<Value> {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|mut v| v.get_mut("id").map(Value::take))
}

/// Best-effort id extraction from a body that failed to decode.
fn salvage_id(body: &[u8]) -> i64 {
    raw_id(body).and_then(|id| id.as_i64()).unwrap_or(0)
}

/// Id of a JSON-RPC line that failed to decode as a [`Request`], or null.
pub fn request_id(line: &str) -> Value {
    raw_id(line.as_bytes()).unwrap_or(Value::Null)
}

/// HTTP result envelope: `result` XOR `error`, always echoing `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub result: Value,
    pub error: Option<RpcError>,
    pub id: i64,
}

impl ResultEnvelope {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            result,
            error: None,
            id,
        }
    }

    pub fn failure(id: i64, error: RpcError) -> Self {
        Self {
            result: Value::Null,
            error: Some(error),
            id,
        }
    }
}

impl From<EnvelopeDecodeError> for ResultEnvelope {
    fn from(err: EnvelopeDecodeError) -> Self {
        let id = err.id;
        ResultEnvelope::failure(id, RpcError::new(DECODE_ERROR, err.message, Value::Null))
    }
}
