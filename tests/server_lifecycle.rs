mod common;

use std::time::Duration;

use common::{Arith, http_client, start_server};
use rpcgate::config::ServerConfig;
use rpcgate::error::{ConfigError, RegistrationError, ServerError};
use rpcgate::rpc::drain::{DrainState, Protocol};
use rpcgate::rpc::{ClientError, Codec, ResultEnvelope, RpcClient, Server};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn test_json_rpc_call() {
    let server = start_server(ServerConfig::loopback()).await;

    let client = RpcClient::new(server.json.to_string());
    let sum: i64 = client.call("Arith.Sum", json!({"A": 7, "B": 8})).await.unwrap();
    assert_eq!(sum, 15);

    let diff: i64 = client.call("Arith.Diff", json!({"A": 7, "B": 8})).await.unwrap();
    assert_eq!(diff, -1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_binary_call() {
    let server = start_server(ServerConfig::loopback()).await;

    let client = RpcClient::new(server.binary.to_string()).with_codec(Codec::Binary);
    let sum: i64 = client.call("Arith.Sum", json!({"A": 2, "B": 3})).await.unwrap();
    assert_eq!(sum, 5);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_structured_error_survives_both_protocols() {
    let server = start_server(ServerConfig::loopback()).await;

    for (addr, codec) in [(server.json, Codec::Json), (server.binary, Codec::Binary)] {
        let client = RpcClient::new(addr.to_string()).with_codec(codec);
        let err = client
            .call_value("Arith.Sum", json!({"A": 0, "B": 0}))
            .await
            .unwrap_err();

        let ClientError::Rpc(wire) = err else {
            panic!("expected an RPC error, got {:?}", err);
        };
        let structured = wire.into_structured().expect("structured error");
        assert_eq!(structured.code, "422");
        assert_eq!(structured.message, "missing parameter");
        assert_eq!(structured.data, json!({"A": 0, "B": 0}));
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_json_rpc_unknown_method_keeps_connection_open() {
    let server = start_server(ServerConfig::loopback()).await;

    let stream = TcpStream::connect(server.json).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer
        .write_all(b"{\"method\":\"Arith.Nope\",\"params\":null,\"id\":4}\n")
        .await
        .unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["result"], Value::Null);
    assert!(!reply["error"].is_null());

    writer
        .write_all(b"{\"method\":\"Arith.Sum\",\"params\":{\"A\":1,\"B\":1},\"id\":5}\n")
        .await
        .unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["result"], 2);

    drop(writer);
    drop(reader);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_json_rpc_malformed_request_keeps_id() {
    let server = start_server(ServerConfig::loopback()).await;

    let stream = TcpStream::connect(server.json).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer
        .write_all(b"{\"method\":5,\"params\":null,\"id\":42}\n")
        .await
        .unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["result"], Value::Null);
    assert!(!reply["error"].is_null());

    writer.write_all(b"not json\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["id"], Value::Null);
    assert!(!reply["error"].is_null());

    drop(writer);
    drop(reader);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_json_rpc_oversized_line_closes_connection() {
    let server = start_server(ServerConfig::loopback()).await;

    let stream = TcpStream::connect(server.json).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let chunk = vec![b'x'; 1 << 20];
    let flood = tokio::spawn(async move {
        for _ in 0..(rpcgate::rpc::binary::MAX_FRAME_LEN >> 20) + 2 {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let mut line = String::new();
    let read = timeout(Duration::from_secs(10), reader.read_line(&mut line))
        .await
        .expect("oversized line was not rejected");
    assert_eq!(read.unwrap_or(0), 0);

    drop(reader);
    let _ = flood.await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_post_dispatches_locally() {
    let server = start_server(ServerConfig::loopback()).await;
    let client = http_client();

    let reply: ResultEnvelope = client
        .post(format!("http://{}/rpc", server.http))
        .json(&json!({"method": "Arith.Sum", "params": {"A": 7, "B": 8}, "id": 3}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(reply, ResultEnvelope::success(3, json!(15)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_post_with_address_forwards() {
    let backend = start_server(ServerConfig::loopback()).await;
    let front = start_server(ServerConfig::loopback()).await;
    let client = http_client();

    let reply: ResultEnvelope = client
        .post(format!("http://{}/rpc", front.http))
        .json(&json!({
            "method": "Arith.Sum",
            "params": {"A": 0, "B": 0},
            "id": 8,
            "address": backend.json.to_string(),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let error = reply.error.expect("relayed error");
    assert_eq!(reply.id, 8);
    assert_eq!(error.code, "422");
    assert_eq!(error.data, json!({"A": 0, "B": 0}));

    front.stop().await.unwrap();
    backend.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_http_path_serves_default_route() {
    let config = ServerConfig {
        http_path: String::new(),
        ..ServerConfig::loopback()
    };
    let server = start_server(config).await;

    let reply: ResultEnvelope = http_client()
        .post(format!("http://{}/rpc", server.http))
        .json(&json!({"method": "Arith.Sum", "params": {"A": 2, "B": 2}, "id": 6}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply, ResultEnvelope::success(6, json!(4)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_relative_http_path_is_rejected() {
    let config = ServerConfig {
        http_path: "rpc".to_string(),
        ..ServerConfig::loopback()
    };
    let server = Server::new(config);
    server.register(Arith).unwrap();

    let result = timeout(Duration::from_secs(5), server.listen_until(async {}))
        .await
        .expect("listen did not return");
    assert!(matches!(
        result,
        Err(ServerError::Config(ConfigError::InvalidPath(p))) if p == "rpc"
    ));
}

#[tokio::test]
async fn test_http_malformed_envelope() {
    let server = start_server(ServerConfig::loopback()).await;
    let client = http_client();
    let url = format!("http://{}/rpc", server.http);

    let reply: ResultEnvelope = client
        .post(&url)
        .body("{\"id\": 12, \"method\": 5}")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply.id, 12);
    assert_eq!(reply.error.expect("decode error").code, "400");

    let reply: ResultEnvelope = client
        .post(&url)
        .body("not json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply.id, 0);
    assert_eq!(reply.result, Value::Null);
    assert_eq!(reply.error.expect("decode error").code, "400");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_services_listing() {
    let server = start_server(ServerConfig::loopback()).await;
    let client = http_client();

    let services: Value = client
        .get(format!("http://{}/services", server.http))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(services[0]["name"], "Arith");
    assert_eq!(services[0]["methods"]["Sum"], "fn(Args) -> i64");
    assert_eq!(services[0]["methods"]["Sleep"], "fn(u64) -> u64");

    let favicon = client
        .get(format!("http://{}/favicon.ico", server.http))
        .send()
        .await
        .unwrap();
    assert_eq!(favicon.status(), reqwest::StatusCode::OK);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_with_no_connections() {
    let server = start_server(ServerConfig::loopback()).await;
    let mut snapshots = server.snapshots.clone();

    server.stop().await.unwrap();

    let last = *snapshots.borrow_and_update();
    assert_eq!(last.state, DrainState::Stopped);
    assert!(last.counters.is_idle());
}

#[tokio::test]
async fn test_drain_waits_for_open_connection() {
    let mut server = start_server(ServerConfig::loopback()).await;
    let mut snapshots = server.snapshots.clone();

    let conn = TcpStream::connect(server.json).await.unwrap();
    timeout(Duration::from_secs(2), snapshots.wait_for(|s| s.counters.rpc == 1))
        .await
        .expect("timeout waiting for open")
        .unwrap();

    server.shutdown();
    timeout(
        Duration::from_secs(2),
        snapshots.wait_for(|s| s.state == DrainState::Draining),
    )
    .await
    .expect("timeout waiting for drain")
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!server.handle.is_finished());
    assert!(TcpStream::connect(server.json).await.is_err());

    drop(conn);
    server.stop().await.unwrap();
    assert_eq!(snapshots.borrow().state, DrainState::Stopped);
}

#[tokio::test]
async fn test_in_flight_call_completes_during_drain() {
    let mut server = start_server(ServerConfig::loopback()).await;

    let stream = TcpStream::connect(server.json).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    writer
        .write_all(b"{\"method\":\"Arith.Sleep\",\"params\":300,\"id\":1}\n")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown();

    let mut line = String::new();
    timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .expect("timeout waiting for reply")
        .unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["result"], 300);

    drop(writer);
    drop(reader);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_drain_timeout_reports_remaining() {
    let config = ServerConfig {
        drain_timeout_secs: Some(1),
        ..ServerConfig::loopback()
    };
    let server = start_server(config).await;
    let mut snapshots = server.snapshots.clone();

    let _held = TcpStream::connect(server.json).await.unwrap();
    timeout(Duration::from_secs(2), snapshots.wait_for(|s| s.counters.rpc == 1))
        .await
        .expect("timeout waiting for open")
        .unwrap();

    match server.stop().await {
        Err(ServerError::DrainTimeout { timeout, remaining }) => {
            assert_eq!(timeout, Duration::from_secs(1));
            assert_eq!(remaining.rpc, 1);
        }
        other => panic!("expected DrainTimeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let config = ServerConfig {
        idle_timeout_secs: Some(1),
        ..ServerConfig::loopback()
    };
    let server = start_server(config).await;

    let stream = TcpStream::connect(server.json).await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = timeout(Duration::from_secs(3), reader.read_line(&mut line))
        .await
        .expect("idle connection was not closed");
    assert_eq!(read.unwrap_or(0), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_only_enabled_protocols_listen() {
    let config = ServerConfig {
        enable_binary: false,
        enable_http: false,
        ..ServerConfig::loopback()
    };
    let mut server = Server::new(config);
    server.register(Arith).unwrap();
    server.bind().await.unwrap();

    assert!(server.local_addr(Protocol::Json).is_some());
    assert!(server.local_addr(Protocol::Binary).is_none());
    assert!(server.local_addr(Protocol::Http).is_none());

    server.listen_until(async {}).await.unwrap();
}

#[tokio::test]
async fn test_no_enabled_protocols() {
    let config = ServerConfig {
        enable_binary: false,
        enable_json: false,
        enable_http: false,
        ..ServerConfig::loopback()
    };
    let server = Server::new(config);
    assert!(matches!(
        server.listen_until(async {}).await,
        Err(ServerError::NoListeners)
    ));
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let server = Server::new(ServerConfig::loopback());
    server.register(Arith).unwrap();

    assert!(matches!(
        server.register(Arith),
        Err(RegistrationError::DuplicateService(name)) if name == "Arith"
    ));
    server.register_name("Math", Arith).unwrap();
    assert_eq!(server.registry().descriptors().len(), 2);
}
