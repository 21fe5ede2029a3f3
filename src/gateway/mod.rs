//! HTTP gateway in front of several RPC servers.
//!
//! ## Endpoints
//!
//! - `POST {prefix}` - call envelope, routed by service name or `address`
//! - `GET /registry` - known backends
//! - `GET /registry/{name}/services` - the backend's own `/services` listing
//! - `GET /favicon.ico` - empty 200

pub mod bridge;
pub mod registry;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, listen_address, route_path};
use crate::error::{ConfigError, ServerError};
use crate::rpc::client::dial_address;
use crate::rpc::drain::{self, DrainController, DrainSnapshot};
use crate::rpc::protocol::{
    CallEnvelope, NOT_FOUND, ResultEnvelope, RpcError, SERVICE_NOT_FOUND,
};
use crate::rpc::transport;

pub use bridge::ProtocolBridge;
pub use registry::{BackendEntry, GatewayRegistry};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service {0} has no HTTP address")]
    NoHttpAddress(String),

    #[error("failed to query backend {name}: {source}")]
    Introspect {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to bind gateway on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

impl GatewayError {
    /// Structured form returned in a result envelope.
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            GatewayError::ServiceNotFound(name) => {
                RpcError::new(NOT_FOUND, SERVICE_NOT_FOUND, Value::String(name))
            }
            other => RpcError::transport(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::ServiceNotFound(_) | GatewayError::NoHttpAddress(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Introspect { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// State shared by every gateway request.
#[derive(Clone)]
struct GatewayState {
    registry: GatewayRegistry,
    bridge: ProtocolBridge,
    http: reqwest::Client,
}

pub struct Gateway {
    config: GatewayConfig,
    state: GatewayState,
    listener: Option<TcpListener>,
    snapshots: Option<watch::Sender<DrainSnapshot>>,
}

impl Gateway {
    /// Build a gateway seeded with the configured backends.
    pub fn new(config: GatewayConfig) -> Self {
        let state = GatewayState {
            registry: GatewayRegistry::from_entries(config.backends.iter().cloned()),
            bridge: ProtocolBridge::new(config.call_timeout_secs.map(Duration::from_secs)),
            http: reqwest::Client::new(),
        };
        Self {
            config,
            state,
            listener: None,
            snapshots: None,
        }
    }

    pub fn registry(&self) -> &GatewayRegistry {
        &self.state.registry
    }

    pub async fn add_or_update(
        &self,
        name: &str,
        rpc_address: &str,
        http_address: Option<&str>,
    ) -> BackendEntry {
        self.state
            .registry
            .add_or_update(name, rpc_address, http_address)
            .await
    }

    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_snapshots(mut self, tx: watch::Sender<DrainSnapshot>) -> Self {
        self.snapshots = Some(tx);
        self
    }

    pub async fn bind(&mut self) -> Result<(), GatewayError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let addr = listen_address(&self.config.bind);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        self.listener = Some(listener);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Build the HTTP routes. An empty prefix serves calls on `/rpc`.
    pub fn router(&self) -> Result<Router, ConfigError> {
        let prefix = route_path(&self.config.prefix_path)?;
        Ok(Router::new()
            .route(prefix, post(call))
            .route("/registry", get(list_backends))
            .route("/registry/{name}/services", get(backend_services))
            .route("/favicon.ico", get(|| async { StatusCode::OK }))
            .with_state(self.state.clone()))
    }

    /// Route one raw call envelope.
    pub async fn handle(&self, body: &[u8]) -> ResultEnvelope {
        route_call(&self.state, body).await
    }

    /// Serve until SIGINT/SIGTERM, then drain.
    pub async fn listen(self) -> Result<(), GatewayError> {
        self.listen_until(drain::os_signal()).await
    }

    pub async fn listen_until<F>(mut self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        let router = self.router()?;
        self.bind().await?;
        let Some(listener) = self.listener.take() else {
            return Err(ServerError::NoListeners.into());
        };

        let drain_timeout = self.config.drain_timeout_secs.map(Duration::from_secs);
        let controller = DrainController::new(1, drain_timeout);
        let controller = match self.snapshots.take() {
            Some(tx) => controller.publish_to(tx),
            None => controller,
        };

        tokio::spawn(transport::serve_http(
            listener,
            router,
            controller.events(),
            controller.tokens(),
        ));

        let backends = self.state.registry.len().await;
        info!(prefix = %self.config.prefix_path, backends, "Gateway started");
        controller.run(shutdown).await?;
        Ok(())
    }
}

async fn call(State(state): State<GatewayState>, body: Bytes) -> Json<ResultEnvelope> {
    Json(route_call(&state, &body).await)
}

async fn route_call(state: &GatewayState, body: &[u8]) -> ResultEnvelope {
    let envelope = match CallEnvelope::parse(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Malformed call envelope");
            return e.into();
        }
    };
    let id = envelope.id;

    let address = match envelope.address_override() {
        Some(address) => address.to_string(),
        None => {
            let service = envelope.service_name();
            match state.registry.lookup(&service).await {
                Ok(entry) => entry.rpc_address,
                Err(e) => {
                    debug!(service = %service, "No backend registered");
                    return ResultEnvelope::failure(id, e.into_rpc_error());
                }
            }
        }
    };

    debug!(method = %envelope.method, address = %address, "Bridging call");
    match state.bridge.call(&address, &envelope.method, envelope.params).await {
        Ok(result) => ResultEnvelope::success(id, result),
        Err(e) => ResultEnvelope::failure(id, e),
    }
}

async fn list_backends(State(state): State<GatewayState>) -> Json<Vec<BackendEntry>> {
    let mut backends = state.registry.list().await;
    backends.sort_by(|a, b| a.name.cmp(&b.name));
    Json(backends)
}

async fn backend_services(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let entry = state.registry.lookup(&name).await?;
    let http = entry
        .http_address
        .ok_or_else(|| GatewayError::NoHttpAddress(name.clone()))?;

    let url = format!("http://{}/services", dial_address(&http));
    let fetched = async {
        state
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    };

    fetched.await.map(Json).map_err(|source| {
        warn!(service = %name, url = %url, error = %source, "Backend introspection failed");
        GatewayError::Introspect { name, source }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    fn config(prefix: &str) -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1:0".to_string(),
            prefix_path: prefix.to_string(),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_listen_future_is_send() {
        let listen = Gateway::new(config("/rpc")).listen_until(async {});
        assert_send(&listen);
        let listen = Gateway::new(config("/rpc")).listen();
        assert_send(&listen);
    }

    #[test]
    fn test_empty_prefix_falls_back() {
        assert!(Gateway::new(config("")).router().is_ok());
    }

    #[test]
    fn test_relative_prefix_is_rejected() {
        match Gateway::new(config("api")).router() {
            Err(ConfigError::InvalidPath(path)) => assert_eq!(path, "api"),
            other => panic!("expected InvalidPath, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_relative_prefix_fails_listen() {
        let err = Gateway::new(config("api"))
            .listen_until(async {})
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(ConfigError::InvalidPath(_))));
    }
}
