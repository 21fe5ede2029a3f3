//! One-shot calls from the gateway to a backend.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::rpc::client::{ClientError, RpcClient};
use crate::rpc::protocol::RpcError;

/// Opens a transient JSON-RPC connection per call.
#[derive(Debug, Clone, Default)]
pub struct ProtocolBridge {
    timeout: Option<Duration>,
}

impl ProtocolBridge {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Call `method` on the backend at `address`.
    ///
    /// The connection is dropped before returning on every path. Structured
    /// errors from the backend come back unchanged; anything else is wrapped
    /// as a transport error.
    pub async fn call(
        &self,
        address: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let client = RpcClient::new(address).with_timeout(self.timeout);

        client.call_value(method, params).await.map_err(|e| {
            debug!(address, method, error = %e, "Backend call failed");
            match e {
                ClientError::Rpc(wire) => match wire.into_structured() {
                    Ok(structured) => structured,
                    Err(text) => RpcError::transport(text),
                },
                other => RpcError::transport(other.to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Backend that answers one request with a canned line.
    async fn canned_backend(reply: Value) -> String {
        let reply = format!("{}\n", reply);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_reparses_structured_error_from_string() {
        let error = json!({"code": "422", "message": "missing parameter", "data": {"A": 0}});
        let reply = json!({"result": null, "error": error.to_string(), "id": 1});
        let addr = canned_backend(reply).await;

        let err = ProtocolBridge::default()
            .call(&addr, "Arith.Sum", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, "422");
        assert_eq!(err.message, "missing parameter");
        assert_eq!(err.data, json!({"A": 0}));
    }

    #[tokio::test]
    async fn test_wraps_plain_string_error() {
        let reply = json!({"result": null, "error": "rpc: can't find service X", "id": 1});
        let addr = canned_backend(reply).await;

        let err = ProtocolBridge::default()
            .call(&addr, "X.Y", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, "500");
        assert_eq!(err.message, "rpc: can't find service X");
    }

    #[tokio::test]
    async fn test_wraps_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = ProtocolBridge::default()
            .call(&addr, "A.B", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, "500");
        assert!(err.message.contains("failed to connect"));
    }
}
