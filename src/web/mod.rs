//! HTTP bridge for an RPC server.
//!
//! ## Endpoints
//!
//! - `POST {path}` - call envelope; dispatched locally, or forwarded to the
//!   JSON-RPC server named by `address`
//! - `GET /services` - JSON dump of the registered services
//! - `GET /favicon.ico` - empty 200

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;

use crate::config::route_path;
use crate::error::ConfigError;
use crate::gateway::bridge::ProtocolBridge;
use crate::rpc::protocol::{CallEnvelope, ResultEnvelope};
use crate::rpc::registry::{ServiceDescriptor, ServiceRegistry};

/// Shared state for the HTTP bridge
#[derive(Clone)]
pub struct WebState {
    pub registry: Arc<ServiceRegistry>,
    pub bridge: ProtocolBridge,
}

/// Build the bridge routes; an empty `path` serves calls on `/rpc`.
pub fn router(state: WebState, path: &str) -> Result<Router, ConfigError> {
    Ok(Router::new()
        .route(route_path(path)?, post(call))
        .route("/services", get(services))
        .route("/favicon.ico", get(|| async { StatusCode::OK }))
        .with_state(state))
}

async fn services(State(state): State<WebState>) -> Json<Vec<ServiceDescriptor>> {
    Json(state.registry.descriptors())
}

async fn call(State(state): State<WebState>, body: Bytes) -> Json<ResultEnvelope> {
    Json(handle_call(&state, &body).await)
}

pub(crate) async fn handle_call(state: &WebState, body: &[u8]) -> ResultEnvelope {
    let envelope = match CallEnvelope::parse(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Malformed call envelope");
            return e.into();
        }
    };
    let id = envelope.id;

    if let Some(address) = envelope.address_override() {
        return match state
            .bridge
            .call(address, &envelope.method, envelope.params.clone())
            .await
        {
            Ok(result) => ResultEnvelope::success(id, result),
            Err(e) => ResultEnvelope::failure(id, e),
        };
    }

    match state.registry.dispatch(&envelope.method, envelope.params).await {
        Ok(result) => ResultEnvelope::success(id, result),
        Err(e) => ResultEnvelope::failure(id, e.into_rpc_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::RpcError;
    use crate::rpc::registry::{MethodSet, Service};
    use serde_json::{Value, json};

    struct Echo;

    impl Service for Echo {
        fn methods(methods: &mut MethodSet<Self>) {
            methods.add("Say", |_: &Echo, words: String| Ok::<_, RpcError>(words));
        }
    }

    fn state() -> WebState {
        let registry = ServiceRegistry::new();
        registry.register(Echo).unwrap();
        WebState {
            registry: Arc::new(registry),
            bridge: ProtocolBridge::default(),
        }
    }

    #[test]
    fn test_router_path_validation() {
        assert!(router(state(), "").is_ok());
        assert!(router(state(), "/call").is_ok());
        assert!(matches!(
            router(state(), "call"),
            Err(ConfigError::InvalidPath(path)) if path == "call"
        ));
    }

    #[tokio::test]
    async fn test_local_dispatch_echoes_id() {
        let reply = handle_call(&state(), br#"{"method":"Echo.Say","params":"hi","id":42}"#).await;
        assert_eq!(reply, ResultEnvelope::success(42, json!("hi")));
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_found() {
        let reply = handle_call(&state(), br#"{"method":"Echo.Shout","id":2}"#).await;
        assert_eq!(reply.id, 2);
        assert_eq!(reply.result, Value::Null);
        assert_eq!(reply.error.unwrap().code, "404");
    }

    #[tokio::test]
    async fn test_bad_params_is_decode_error() {
        let reply = handle_call(&state(), br#"{"method":"Echo.Say","params":5,"id":3}"#).await;
        assert_eq!(reply.error.unwrap().code, "400");
    }
}
