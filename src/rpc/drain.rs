//! Connection accounting and graceful shutdown.
//!
//! Every acceptor and connection task reports lifecycle events over one
//! channel. A single consumer ([`DrainController::run`]) applies them to a
//! [`DrainMachine`], so the "all counters zero" decision is never taken
//! against a half-updated view.
//!
//! ```text
//! Running --shutdown--> Draining --acceptors stopped, counters zero--> Stopped
//!    |                      |
//!    +------fatal error-----+--> force close, counters zero --> Stopped(err)
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;

/// Wire protocol served by an acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Binary,
    Json,
    Http,
}

impl Protocol {
    pub fn class(self) -> ConnectionClass {
        match self {
            Protocol::Binary | Protocol::Json => ConnectionClass::Rpc,
            Protocol::Http => ConnectionClass::Http,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Binary => "rpc",
            Protocol::Json => "json-rpc",
            Protocol::Http => "http",
        })
    }
}

/// Counter bucket a connection is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClass {
    Rpc,
    Http,
}

/// Open connections per class. Only the controller loop mutates these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounters {
    pub rpc: u64,
    pub http: u64,
}

impl ConnectionCounters {
    fn slot(&mut self, class: ConnectionClass) -> &mut u64 {
        match class {
            ConnectionClass::Rpc => &mut self.rpc,
            ConnectionClass::Http => &mut self.http,
        }
    }

    pub fn get(&self, class: ConnectionClass) -> u64 {
        match class {
            ConnectionClass::Rpc => self.rpc,
            ConnectionClass::Http => self.http,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.rpc == 0 && self.http == 0
    }
}

impl fmt::Display for ConnectionCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc={} http={}", self.rpc, self.http)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainState {
    Running,
    Draining,
    Stopped,
}

/// Point-in-time view published after every processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainSnapshot {
    pub state: DrainState,
    pub counters: ConnectionCounters,
}

/// Input to the drain state machine.
#[derive(Debug)]
pub enum Event {
    Open {
        protocol: Protocol,
        peer: Option<SocketAddr>,
    },
    Close {
        protocol: Protocol,
        peer: Option<SocketAddr>,
    },
    /// An acceptor has dropped its listener and will accept nothing more.
    AcceptorStopped(Protocol),
    Shutdown,
    Fatal(ServerError),
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Stop accepting: drop every listener.
    CloseListeners,
    /// Drop every listener and cancel every connection.
    ForceClose,
}

/// Pure transition logic, free of I/O so every interleaving can be tested.
#[derive(Debug)]
pub struct DrainMachine {
    state: DrainState,
    counters: ConnectionCounters,
    live_acceptors: usize,
    fatal: Option<ServerError>,
}

impl DrainMachine {
    pub fn new(acceptors: usize) -> Self {
        Self {
            state: DrainState::Running,
            counters: ConnectionCounters::default(),
            live_acceptors: acceptors,
            fatal: None,
        }
    }

    pub fn state(&self) -> DrainState {
        self.state
    }

    pub fn counters(&self) -> ConnectionCounters {
        self.counters
    }

    pub fn snapshot(&self) -> DrainSnapshot {
        DrainSnapshot {
            state: self.state,
            counters: self.counters,
        }
    }

    pub fn handle(&mut self, event: Event) -> Action {
        if self.state == DrainState::Stopped {
            debug!(?event, "Event after stop ignored");
            return Action::None;
        }

        let action = match event {
            Event::Open { protocol, peer } => {
                *self.counters.slot(protocol.class()) += 1;
                debug!(%protocol, ?peer, counters = %self.counters, "CONNECT");
                Action::None
            }
            Event::Close { protocol, peer } => {
                let slot = self.counters.slot(protocol.class());
                match slot.checked_sub(1) {
                    Some(n) => *slot = n,
                    None => error!(%protocol, ?peer, "Close without matching open"),
                }
                debug!(%protocol, ?peer, counters = %self.counters, "DISCONNECT");
                Action::None
            }
            Event::AcceptorStopped(protocol) => {
                self.live_acceptors = self.live_acceptors.saturating_sub(1);
                debug!(%protocol, remaining = self.live_acceptors, "Acceptor stopped");
                Action::None
            }
            Event::Shutdown => {
                if self.state == DrainState::Running {
                    info!(open = %self.counters, "Shutdown requested, draining connections");
                    self.state = DrainState::Draining;
                    Action::CloseListeners
                } else {
                    Action::None
                }
            }
            Event::Fatal(err) => {
                error!(error = %err, "Listener failed, forcing shutdown");
                if self.fatal.is_none() {
                    self.fatal = Some(err);
                }
                self.state = DrainState::Draining;
                Action::ForceClose
            }
        };

        if self.state == DrainState::Draining && self.live_acceptors == 0 && self.counters.is_idle()
        {
            info!("All connections closed");
            self.state = DrainState::Stopped;
        }

        action
    }

    /// Outcome once stopped: the first fatal error, if any.
    pub fn into_result(self) -> Result<(), ServerError> {
        match self.fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Cloneable handle acceptors and connections use to report events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Register a new connection. The returned guard reports the close when dropped.
    pub fn open(&self, protocol: Protocol, peer: Option<SocketAddr>) -> ConnectionGuard {
        let _ = self.tx.send(Event::Open { protocol, peer });
        ConnectionGuard {
            tx: self.tx.clone(),
            protocol,
            peer,
        }
    }

    pub fn acceptor_stopped(&self, protocol: Protocol) {
        let _ = self.tx.send(Event::AcceptorStopped(protocol));
    }

    pub fn fatal(&self, err: ServerError) {
        let _ = self.tx.send(Event::Fatal(err));
    }

    #[cfg(test)]
    pub(crate) fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Held for the lifetime of one connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    tx: mpsc::UnboundedSender<Event>,
    protocol: Protocol,
    peer: Option<SocketAddr>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Event::Close {
            protocol: self.protocol,
            peer: self.peer,
        });
    }
}

/// Cancellation handles owned by the controller.
#[derive(Debug, Clone, Default)]
pub struct DrainTokens {
    /// Cancelled when listeners must be dropped
    pub listeners: CancellationToken,
    /// Cancelled when open connections must be abandoned
    pub connections: CancellationToken,
}

/// Serialized consumer of connection lifecycle events.
pub struct DrainController {
    machine: DrainMachine,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    tokens: DrainTokens,
    drain_timeout: Option<Duration>,
    snapshot: watch::Sender<DrainSnapshot>,
}

impl DrainController {
    /// Create a controller expecting `acceptors` listeners to report in.
    pub fn new(acceptors: usize, drain_timeout: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = DrainMachine::new(acceptors);
        let (snapshot, _) = watch::channel(machine.snapshot());

        Self {
            machine,
            tx,
            rx,
            tokens: DrainTokens::default(),
            drain_timeout,
            snapshot,
        }
    }

    pub fn events(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn tokens(&self) -> DrainTokens {
        self.tokens.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DrainSnapshot> {
        self.snapshot.subscribe()
    }

    /// Publish snapshots through an externally created channel.
    pub fn publish_to(mut self, tx: watch::Sender<DrainSnapshot>) -> Self {
        tx.send_replace(self.machine.snapshot());
        self.snapshot = tx;
        self
    }

    /// Process events until stopped.
    ///
    /// Returns the first fatal error, [`ServerError::DrainTimeout`] if the
    /// drain deadline passed with connections still open, or `Ok` on a
    /// clean drain.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        // From here only acceptors and connections keep the channel open.
        let (detached, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.tx, detached));

        let mut signalled = false;
        let mut deadline: Option<Pin<Box<Sleep>>> = None;

        while self.machine.state() != DrainState::Stopped {
            let step = tokio::select! {
                event = self.rx.recv() => Step::Event(event),
                _ = &mut shutdown, if !signalled => {
                    signalled = true;
                    Step::Event(Some(Event::Shutdown))
                }
                _ = expire(&mut deadline) => Step::Expired,
            };

            let event = match step {
                Step::Event(Some(event)) => event,
                Step::Event(None) => return self.disconnected(),
                Step::Expired => return self.abandon(),
            };

            match self.machine.handle(event) {
                Action::None => {}
                Action::CloseListeners => {
                    self.tokens.listeners.cancel();
                    self.arm(&mut deadline);
                }
                Action::ForceClose => {
                    self.tokens.listeners.cancel();
                    self.tokens.connections.cancel();
                    self.arm(&mut deadline);
                }
            }

            self.snapshot.send_replace(self.machine.snapshot());
        }

        info!("Server stopped");
        self.machine.into_result()
    }

    fn arm(&self, deadline: &mut Option<Pin<Box<Sleep>>>) {
        if let (None, Some(timeout)) = (deadline.as_ref(), self.drain_timeout) {
            *deadline = Some(Box::pin(tokio::time::sleep(timeout)));
        }
    }

    /// Every sender is gone, so no acceptor or connection is left to report.
    fn disconnected(self) -> Result<(), ServerError> {
        error!(state = ?self.machine.state(), "Event channel closed before stop");
        self.tokens.listeners.cancel();
        self.tokens.connections.cancel();
        let fatal = self.machine.into_result();
        fatal.and(Err(ServerError::EventsClosed))
    }

    /// Give up on stuck connections once the drain deadline passes.
    fn abandon(mut self) -> Result<(), ServerError> {
        let remaining = self.machine.counters();
        warn!(open = %remaining, "Drain deadline reached, abandoning connections");
        self.tokens.listeners.cancel();
        self.tokens.connections.cancel();
        self.machine.state = DrainState::Stopped;
        self.snapshot.send_replace(self.machine.snapshot());

        match self.machine.into_result() {
            Err(err) => Err(err),
            Ok(()) => Err(ServerError::DrainTimeout {
                timeout: self.drain_timeout.unwrap_or_default(),
                remaining,
            }),
        }
    }
}

enum Step {
    Event(Option<Event>),
    Expired,
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to register signal handlers");
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to wait for Ctrl+C");
            return std::future::pending().await;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
