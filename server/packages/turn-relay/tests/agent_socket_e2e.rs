use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use turn_relay::app::build_router;
use turn_relay::relay::{Relay, RelayConfig};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct LiveServer {
    addr: SocketAddr,
    relay: Arc<Relay>,
    task: tokio::task::JoinHandle<()>,
}

impl LiveServer {
    async fn start() -> Self {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = build_router(relay.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, relay, task }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect_agent(&self, client_id: &str) -> AgentSocket {
        let (mut socket, _) = connect_async(format!("ws://{}/ws?clientId={client_id}", self.addr))
            .await
            .expect("connect agent");
        let welcome = next_json(&mut socket).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["clientId"], client_id);
        assert!(welcome["serverTime"].is_i64());
        socket
    }
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn next_json(socket: &mut AgentSocket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("message within deadline")
            .expect("socket open")
            .expect("read");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("json");
        }
    }
}

async fn send_json(socket: &mut AgentSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("send");
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_socket_round_trip_over_websocket() {
    let server = LiveServer::start().await;
    let mut agent = server.connect_agent("tab-1").await;

    send_json(&mut agent, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut agent).await["type"], "pong");

    let client = reqwest::Client::new();
    let url = server.url("/v1/responses");
    let pending = tokio::spawn(async move {
        client
            .post(url)
            .json(&json!({"input": "What is Rust?"}))
            .send()
            .await
            .expect("post")
            .json::<Value>()
            .await
            .expect("json body")
    });

    let prompt = next_json(&mut agent).await;
    assert_eq!(prompt["type"], "prompt");
    assert_eq!(prompt["input"], "What is Rust?");
    let id = prompt["id"].as_str().expect("id").to_string();

    send_json(
        &mut agent,
        json!({"type": "sse", "id": id, "data": "data: {\"v\": \"A systems \"}\n\ndata: {\"v\": \"language.\"}\n\n"}),
    )
    .await;
    send_json(&mut agent, json!({"type": "done", "id": id})).await;

    let body = pending.await.expect("join");
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output_text"], "A systems language.");
}

#[tokio::test(flavor = "multi_thread")]
async fn sole_agent_disconnect_fails_active_turn() {
    let server = LiveServer::start().await;
    let mut agent = server.connect_agent("tab-1").await;

    let client = reqwest::Client::new();
    let url = server.url("/responses");
    let pending = tokio::spawn(async move {
        client
            .post(url)
            .json(&json!({"input": "hello"}))
            .send()
            .await
            .expect("post")
            .json::<Value>()
            .await
            .expect("json body")
    });

    next_json(&mut agent).await;
    send_json(&mut agent, json!({"type": "sse", "data": {"v": "partial"}})).await;
    agent.close(None).await.expect("close");
    drop(agent);

    let body = pending.await.expect("join");
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"]["code"], "agent_disconnected");
    assert_eq!(body["output_text"], "partial");

    let relay = server.relay.clone();
    wait_for(move || relay.hub().client_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_connection_supersedes_older_one() {
    let server = LiveServer::start().await;
    let mut older = server.connect_agent("tab-1").await;
    let mut newer = server.connect_agent("tab-2").await;

    let client = reqwest::Client::new();
    let url = server.url("/responses");
    let pending = tokio::spawn(async move {
        client
            .post(url)
            .json(&json!({"input": "hello"}))
            .send()
            .await
            .expect("post")
            .json::<Value>()
            .await
            .expect("json body")
    });

    let prompt = next_json(&mut newer).await;
    assert_eq!(prompt["type"], "prompt");

    send_json(&mut older, json!({"type": "done", "text": "from the old tab"})).await;
    send_json(&mut newer, json!({"type": "done", "text": "from the new tab"})).await;

    let body = pending.await.expect("join");
    assert_eq!(body["output_text"], "from the new tab");
}
