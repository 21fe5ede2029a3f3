//! RPC client for calling a server.
//!
//! Every call opens its own TCP connection and drops it when the call
//! returns, whatever the outcome.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::binary::{FrameRequest, FrameResponse, read_frame, write_frame};
use super::protocol::{Request, Response, WireError};
use crate::error::TransportError;

/// Wire codec spoken by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    Binary,
}

/// Error returned by RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] TransportError),

    #[error("failed to encode or decode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("server closed the connection without replying")]
    Closed,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with an error
    #[error("{0}")]
    Rpc(WireError),
}

/// Address to dial; a bare `:port` means the local host.
pub fn dial_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{}", addr)
    } else {
        addr.to_string()
    }
}

/// RPC client bound to one server address.
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
    codec: Codec,
    timeout: Option<Duration>,
}

impl RpcClient {
    /// Client speaking newline-delimited JSON-RPC.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            codec: Codec::Json,
            timeout: None,
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Bound the whole call, connect included.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Call an RPC method and decode the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ClientError> {
        let value = self.call_value(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call an RPC method and return the raw JSON result.
    pub async fn call_value(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let call = async {
            let addr = dial_address(&self.addr);
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|source| ClientError::Connect {
                    addr: addr.clone(),
                    source,
                })?;

            match self.codec {
                Codec::Json => call_json(stream, method, params).await,
                Codec::Binary => call_binary(stream, method, params).await,
            }
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => call.await,
        }
    }
}

async fn call_json(stream: TcpStream, method: &str, params: Value) -> Result<Value, ClientError> {
    let request = Request {
        method: method.to_string(),
        params,
        id: Value::Number(1.into()),
    };

    let mut request_json = serde_json::to_string(&request)?;
    request_json.push('\n');

    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(request_json.as_bytes()).await?;

    let mut response_line = String::new();
    if reader.read_line(&mut response_line).await? == 0 {
        return Err(ClientError::Closed);
    }

    let response: Response = serde_json::from_str(&response_line)?;
    match response.error {
        Some(error) => Err(ClientError::Rpc(error)),
        None => Ok(response.result),
    }
}

async fn call_binary(
    mut stream: TcpStream,
    method: &str,
    params: Value,
) -> Result<Value, ClientError> {
    let request = FrameRequest {
        seq: 1,
        method: method.to_string(),
        params: serde_json::to_vec(&params)?,
    };
    write_frame(&mut stream, &request).await?;

    let response: FrameResponse = read_frame(&mut stream).await?.ok_or(ClientError::Closed)?;
    if let Some(error) = response.error {
        return Err(ClientError::Rpc(WireError::Message(error)));
    }
    if response.result.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&response.result)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_address_fills_local_host() {
        assert_eq!(dial_address(":50052"), "127.0.0.1:50052");
        assert_eq!(dial_address("10.0.0.1:1"), "10.0.0.1:1");
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RpcClient::new(addr).call_value("A.B", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
