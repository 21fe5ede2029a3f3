//! Error taxonomy shared by servers and gateways.

use std::io;
use std::time::Duration;

use serde_json::Value;

use crate::rpc::drain::{ConnectionCounters, Protocol};
use crate::rpc::protocol::{DECODE_ERROR, NOT_FOUND, RpcError, WireError};

/// Rejected service registration.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("invalid service name {0:?}: must be non-empty and contain no '.'")]
    InvalidServiceName(String),

    #[error("invalid method name {service}.{method:?}: must be non-empty and contain no '.'")]
    InvalidMethodName { service: String, method: String },

    #[error("service {0} has no methods")]
    NoMethods(String),

    #[error("method {service}.{method} declared twice")]
    DuplicateMethod { service: String, method: String },

    #[error("service already defined: {0}")]
    DuplicateService(String),
}

/// Failure of a single dispatched call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("rpc: service/method request ill-formed: {0}")]
    MalformedMethod(String),

    #[error("rpc: can't find service {0}")]
    ServiceNotFound(String),

    #[error("rpc: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc: invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("rpc: cannot encode reply of {method}: {reason}")]
    EncodeReply { method: String, reason: String },

    #[error("rpc: handler for {0} did not complete")]
    HandlerAborted(String),

    #[error(transparent)]
    Application(#[from] RpcError),
}

impl CallError {
    /// Encoding for the JSON-RPC error slot.
    pub fn into_wire(self) -> WireError {
        match self {
            CallError::Application(err) => WireError::Structured(err),
            other => WireError::Message(other.to_string()),
        }
    }

    /// Encoding for string-only channels such as the binary protocol.
    pub fn into_text(self) -> String {
        match self {
            CallError::Application(err) => err.to_text(),
            other => other.to_string(),
        }
    }

    /// Structured form for HTTP envelopes.
    pub fn into_rpc_error(self) -> RpcError {
        if let CallError::Application(err) = self {
            return err;
        }
        let code = match self {
            CallError::ServiceNotFound(_) | CallError::MethodNotFound(_) => NOT_FOUND,
            _ => DECODE_ERROR,
        };
        RpcError::new(code, self.to_string(), Value::Null)
    }
}

/// Failure scoped to one connection; logged and never escalated.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("connection idle for longer than {0:?}")]
    IdleTimeout(Duration),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Frame(#[from] postcard::Error),

    #[error("encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Server or gateway lifecycle failure, returned from `listen`.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: Protocol,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{protocol} accept loop failed: {source}")]
    FatalListen {
        protocol: Protocol,
        #[source]
        source: io::Error,
    },

    #[error("drain did not finish within {timeout:?}; still open: {remaining}")]
    DrainTimeout {
        timeout: Duration,
        remaining: ConnectionCounters,
    },

    #[error("no protocol is enabled")]
    NoListeners,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("every acceptor exited without reporting")]
    EventsClosed,
}

/// Failure loading or writing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("failed to encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("route {0:?} must start with '/'")]
    InvalidPath(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
}
