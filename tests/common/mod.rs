#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use rpcgate::config::ServerConfig;
use rpcgate::error::ServerError;
use rpcgate::rpc::drain::{DrainSnapshot, Protocol};
use rpcgate::rpc::{MethodSet, RpcError, Server, Service};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Serialize, Deserialize)]
pub struct Args {
    #[serde(rename = "A")]
    pub a: i64,
    #[serde(rename = "B")]
    pub b: i64,
}

pub struct Arith;

impl Arith {
    fn sum(&self, args: Args) -> Result<i64, RpcError> {
        if args.a == 0 && args.b == 0 {
            return Err(RpcError::new(
                "422",
                "missing parameter",
                json!({"A": args.a, "B": args.b}),
            ));
        }
        Ok(args.a + args.b)
    }

    fn diff(&self, args: Args) -> Result<i64, RpcError> {
        Ok(args.a - args.b)
    }

    fn sleep(&self, millis: u64) -> Result<u64, RpcError> {
        std::thread::sleep(Duration::from_millis(millis));
        Ok(millis)
    }
}

impl Service for Arith {
    fn methods(methods: &mut MethodSet<Self>) {
        methods
            .add("Sum", Arith::sum)
            .add("Diff", Arith::diff)
            .add("Sleep", Arith::sleep);
    }
}

/// A server running in the background on loopback ports.
pub struct RunningServer {
    pub binary: SocketAddr,
    pub json: SocketAddr,
    pub http: SocketAddr,
    pub snapshots: watch::Receiver<DrainSnapshot>,
    shutdown: Option<oneshot::Sender<()>>,
    pub handle: JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Signal shutdown and wait for `listen` to return.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        self.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("timeout waiting for server to stop")
            .expect("server task panicked")
    }
}

pub async fn start_server(config: ServerConfig) -> RunningServer {
    let (snap_tx, snapshots) = watch::channel(initial_snapshot());
    let mut server = Server::new(config).with_snapshots(snap_tx);
    server.register(Arith).expect("register Arith");
    server.bind().await.expect("bind server");

    let binary = server.local_addr(Protocol::Binary).expect("binary addr");
    let json = server.local_addr(Protocol::Json).expect("json addr");
    let http = server.local_addr(Protocol::Http).expect("http addr");

    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(server.listen_until(async move {
        let _ = rx.await;
    }));

    RunningServer {
        binary,
        json,
        http,
        snapshots,
        shutdown: Some(tx),
        handle,
    }
}

pub fn initial_snapshot() -> DrainSnapshot {
    DrainSnapshot {
        state: rpcgate::rpc::drain::DrainState::Running,
        counters: Default::default(),
    }
}

/// HTTP client that does not keep idle connections open.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .expect("build http client")
}
