use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use matter_server::config::ServerConfig;
use matter_server::models::NodeData;
use matter_server::server::{Dispatcher, MatterServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Running {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) {
        self.token.cancel();
        tokio::time::timeout(Duration::from_secs(15), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

async fn start() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ServerConfig {
        port: 0,
        listen_addresses: vec!["127.0.0.1".into()],
        storage_path: dir.path().to_owned(),
        fabric_id: 77,
        ..Default::default()
    };
    cfg.mdns.enabled = false;

    let server = MatterServer::new(cfg).unwrap();
    let dispatcher = server.dispatcher().clone();
    let listeners = server.bind().await.unwrap();
    let addr = listeners[0].local_addr().unwrap();
    let token = CancellationToken::new();
    let task = tokio::spawn(server.serve(listeners, token.clone()));
    Running {
        addr,
        dispatcher,
        token,
        task,
        _dir: dir,
    }
}

async fn get_json(url: &str) -> (u16, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn connect(server: &Running) -> (Ws, Value) {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    let first = next_batch(&mut ws).await;
    assert_eq!(first.len(), 1);
    (ws, first[0].clone())
}

/// Messages of the next text frame; frames may carry several lines.
async fn next_batch(ws: &mut Ws) -> Vec<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return text
                .as_str()
                .split('\n')
                .filter(|l| !l.is_empty())
                .map(|l| serde_json::from_str(l).unwrap())
                .collect();
        }
    }
}

/// Collect results until every id in `ids` was answered, skipping events.
async fn results(ws: &mut Ws, ids: &[&str]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    while out.len() < ids.len() {
        for msg in next_batch(ws).await {
            if let Some(id) = msg.get("message_id").and_then(Value::as_str) {
                assert!(ids.contains(&id), "unexpected reply {}", msg);
                assert!(
                    !out.iter().any(|m| m["message_id"] == id),
                    "duplicate reply {}",
                    msg
                );
                out.push(msg);
            }
        }
    }
    out
}

async fn send(ws: &mut Ws, msg: Value) {
    ws.send(Message::text(msg.to_string())).await.unwrap();
}

#[tokio::test]
async fn http_api() {
    let server = start().await;

    let (status, nodes) = get_json(&server.url("/api/nodes")).await;
    assert_eq!(status, 200);
    assert_eq!(nodes, json!([]));

    server.dispatcher.save_node(NodeData::new(42)).unwrap();

    let (_, nodes) = get_json(&server.url("/api/nodes")).await;
    assert_eq!(nodes.as_array().unwrap().len(), 1);
    assert_eq!(nodes[0]["node_id"], 42);

    let (status, diag) = get_json(&server.url("/api/diagnostics")).await;
    assert_eq!(status, 200);
    assert_eq!(diag["info"]["fabric_id"], 77);
    assert_eq!(diag["nodes"][0]["node_id"], 42);

    let (status, info) = get_json(&server.url("/api/info")).await;
    assert_eq!(status, 200);
    assert_eq!(info["fabric_id"], 77);
    assert_eq!(info["schema_version"], 11);

    let (status, health) = get_json(&server.url("/health")).await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["nodes"], 1);
    assert_eq!(health["connections"], 0);

    let (status, body) = get_json(&server.url("/api/missing")).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], 404);
    assert!(body["error"].is_string());

    server.stop().await;
}

#[tokio::test]
async fn preflight_request() {
    let server = start().await;
    let resp = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, server.url("/api/info"))
        .header("origin", "http://dashboard.local")
        .header("access-control-request-method", "GET")
        .header("access-control-request-headers", "content-type")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .unwrap()
            .to_str()
            .unwrap(),
        "*"
    );
    let methods = resp
        .headers()
        .get("access-control-allow-methods")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(methods.contains("GET"));
    assert!(methods.contains("DELETE"));
    assert!(resp.bytes().await.unwrap().is_empty());

    let resp = reqwest::Client::new()
        .get(server.url("/api/info"))
        .header("origin", "http://dashboard.local")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    server.stop().await;
}

#[tokio::test]
async fn websocket_commands() {
    let server = start().await;
    let (mut ws, hello) = connect(&server).await;
    assert_eq!(hello["fabric_id"], 77);

    send(&mut ws, json!({"message_id": "info", "command": "server_info"})).await;
    let reply = results(&mut ws, &["info"]).await;
    let (_, info) = get_json(&server.url("/api/info")).await;
    assert_eq!(reply[0]["result"]["fabric_id"], info["fabric_id"]);

    send(&mut ws, json!({"message_id": "a", "command": "get_nodes"})).await;
    send(&mut ws, json!({"message_id": "b", "command": "diagnostics"})).await;
    let replies = results(&mut ws, &["a", "b"]).await;
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|r| r.get("result").is_some()));

    send(
        &mut ws,
        json!({"message_id": "nf", "command": "get_node", "args": {"node_id": 5}}),
    )
    .await;
    send(&mut ws, json!({"message_id": "miss", "command": "get_node"})).await;
    send(&mut ws, json!({"message_id": "unk", "command": "reboot_universe"})).await;
    let replies = results(&mut ws, &["nf", "miss", "unk"]).await;
    let code = |id: &str| {
        replies
            .iter()
            .find(|r| r["message_id"] == id)
            .unwrap()["error_code"]
            .clone()
    };
    assert_eq!(code("nf"), 404);
    assert_eq!(code("miss"), 400);
    assert_eq!(code("unk"), 404);

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn malformed_frame_keeps_session() {
    let server = start().await;
    let (mut ws, _) = connect(&server).await;

    ws.send(Message::text("{not json")).await.unwrap();
    let batch = next_batch(&mut ws).await;
    assert_eq!(batch[0]["error_code"], 400);
    assert!(!batch[0]["message_id"].as_str().unwrap().is_empty());

    send(&mut ws, json!({"message_id": "after", "command": "server_info"})).await;
    let reply = results(&mut ws, &["after"]).await;
    assert_eq!(reply[0]["result"]["fabric_id"], 77);

    server.stop().await;
}

#[tokio::test]
async fn node_events_reach_clients() {
    let server = start().await;
    let (mut ws, _) = connect(&server).await;
    // make sure storage is loaded before writing
    let _ = get_json(&server.url("/api/nodes")).await;

    server.dispatcher.save_node(NodeData::new(9)).unwrap();
    let event = loop {
        let batch = next_batch(&mut ws).await;
        if let Some(ev) = batch.into_iter().find(|m| m.get("event").is_some()) {
            break ev;
        }
    };
    assert_eq!(event["event"], "node_added");
    assert_eq!(event["data"]["node_id"], 9);

    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let server = start().await;
    let (mut ws, _) = connect(&server).await;
    server.stop().await;

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}
