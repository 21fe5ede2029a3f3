//! RPC server.
//!
//! A [`Server`] exposes the services in its [`ServiceRegistry`] over up to
//! three listeners at once and drains them together on shutdown.
//!
//! ## Architecture
//!
//! - `protocol`: request/response and envelope types, structured errors
//! - `registry`: service registration and dispatch
//! - `binary`: length-prefixed binary framing
//! - `transport`: accept loops and per-connection serving
//! - `drain`: connection accounting and graceful shutdown
//! - `client`: client for calling a server

pub mod binary;
pub mod client;
pub mod drain;
pub mod protocol;
pub mod registry;
pub(crate) mod transport;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{ServerConfig, listen_address};
use crate::error::{RegistrationError, ServerError};
use crate::gateway::bridge::ProtocolBridge;
use crate::web;
use drain::{DrainController, DrainSnapshot, Protocol};
use transport::ConnectionContext;

pub use client::{ClientError, Codec, RpcClient};
pub use protocol::{CallEnvelope, Request, Response, ResultEnvelope, RpcError, WireError};
pub use registry::{MethodSet, Service, ServiceDescriptor, ServiceRegistry};

/// Pre-bound listeners, one slot per protocol.
#[derive(Default)]
struct Listeners {
    binary: Option<TcpListener>,
    json: Option<TcpListener>,
    http: Option<TcpListener>,
}

/// RPC server bound to an explicit service registry.
pub struct Server {
    config: ServerConfig,
    registry: Arc<ServiceRegistry>,
    listeners: Listeners,
    snapshots: Option<tokio::sync::watch::Sender<DrainSnapshot>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ServiceRegistry::new()),
            listeners: Listeners::default(),
            snapshots: None,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn register<S: Service>(&self, service: S) -> Result<ServiceDescriptor, RegistrationError> {
        self.registry.register(service)
    }

    pub fn register_name<S: Service>(
        &self,
        name: &str,
        service: S,
    ) -> Result<ServiceDescriptor, RegistrationError> {
        self.registry.register_name(name, service)
    }

    /// Use an already bound listener for `protocol` instead of the configured address.
    pub fn with_listener(mut self, protocol: Protocol, listener: TcpListener) -> Self {
        *self.slot(protocol) = Some(listener);
        self
    }

    /// Mirror drain state transitions into `tx`.
    pub fn with_snapshots(mut self, tx: tokio::sync::watch::Sender<DrainSnapshot>) -> Self {
        self.snapshots = Some(tx);
        self
    }

    fn slot(&mut self, protocol: Protocol) -> &mut Option<TcpListener> {
        match protocol {
            Protocol::Binary => &mut self.listeners.binary,
            Protocol::Json => &mut self.listeners.json,
            Protocol::Http => &mut self.listeners.http,
        }
    }

    fn enabled(&self) -> Vec<(Protocol, &str)> {
        let c = &self.config;
        [
            (Protocol::Binary, c.enable_binary, c.binary_bind.as_str()),
            (Protocol::Json, c.enable_json, c.json_bind.as_str()),
            (Protocol::Http, c.enable_http, c.http_bind.as_str()),
        ]
        .into_iter()
        .filter(|(_, on, _)| *on)
        .map(|(p, _, addr)| (p, addr))
        .collect()
    }

    /// Bind every enabled protocol that has no listener yet.
    pub async fn bind(&mut self) -> Result<(), ServerError> {
        let wanted: Vec<(Protocol, String)> = self
            .enabled()
            .into_iter()
            .map(|(p, addr)| (p, listen_address(addr)))
            .collect();

        for (protocol, addr) in wanted {
            if self.slot(protocol).is_some() {
                continue;
            }
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| ServerError::Bind {
                    protocol,
                    addr: addr.clone(),
                    source,
                })?;
            *self.slot(protocol) = Some(listener);
        }
        Ok(())
    }

    /// Address a bound listener is accepting on.
    pub fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        let listener = match protocol {
            Protocol::Binary => &self.listeners.binary,
            Protocol::Json => &self.listeners.json,
            Protocol::Http => &self.listeners.http,
        };
        listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until SIGINT/SIGTERM, then drain.
    pub async fn listen(self) -> Result<(), ServerError> {
        self.listen_until(drain::os_signal()).await
    }

    /// Serve until `shutdown` resolves, then drain.
    ///
    /// Returns the first fatal listener error, or `Ok` once every
    /// connection has closed.
    pub async fn listen_until<F>(mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let state = web::WebState {
            registry: Arc::clone(&self.registry),
            bridge: ProtocolBridge::default(),
        };
        let router = web::router(state, &self.config.http_path)?;

        self.bind().await?;
        if self.registry.is_empty() {
            warn!("Serving with no registered services");
        }

        let protocols: Vec<Protocol> = self.enabled().into_iter().map(|(p, _)| p).collect();
        let bound: Vec<(Protocol, TcpListener)> = protocols
            .into_iter()
            .filter_map(|p| self.slot(p).take().map(|l| (p, l)))
            .collect();
        if bound.is_empty() {
            return Err(ServerError::NoListeners);
        }

        let controller = DrainController::new(
            bound.len(),
            self.config.drain_timeout_secs.map(Duration::from_secs),
        );
        let events = controller.events();
        let tokens = controller.tokens();

        let controller = match self.snapshots.take() {
            Some(tx) => controller.publish_to(tx),
            None => controller,
        };

        let ctx = Arc::new(ConnectionContext {
            registry: Arc::clone(&self.registry),
            events: events.clone(),
            tokens: tokens.clone(),
            idle_timeout: self.config.idle_timeout_secs.map(Duration::from_secs),
        });

        for (protocol, listener) in bound {
            match protocol {
                Protocol::Http => {
                    tokio::spawn(transport::serve_http(
                        listener,
                        router.clone(),
                        events.clone(),
                        tokens.clone(),
                    ));
                }
                _ => {
                    tokio::spawn(transport::accept_loop(listener, protocol, Arc::clone(&ctx)));
                }
            }
        }

        info!(services = self.registry.descriptors().len(), "RPC server started");
        controller.run(shutdown).await
    }
}
