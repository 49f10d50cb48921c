//! HTTP / WebSocket 集成测试（本地回环端口）

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use command_center::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    ingestor: Arc<Ingestor>,
    http: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let store = Arc::new(EventStore::in_memory().unwrap());
        let ingestor = Arc::new(Ingestor::new(store, Broadcaster::new()));
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };

        let server = Server::new(ingestor.clone(), config);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(server.serve(listener, async {
            let _ = rx.await;
        }));

        Self {
            addr,
            ingestor,
            http: reqwest::Client::new(),
            shutdown: Some(tx),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post_event(&self, body: Value) -> reqwest::Response {
        self.http.post(self.url("/events")).json(&body).send().await.unwrap()
    }

    async fn get_json(&self, path: &str) -> Value {
        self.http
            .get(self.url(path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn connect_stream(&self) -> Ws {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/stream", self.addr))
            .await
            .unwrap();
        // 首帧是 connected
        let first = next_message(&mut ws).await;
        assert!(matches!(first, StreamMessage::Connected { .. }));
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// 读取下一条业务消息（跳过心跳）
async fn next_message(ws: &mut Ws) -> StreamMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            let message = StreamMessage::from_frame(text.as_str()).unwrap();
            if message != StreamMessage::Ping {
                return message;
            }
        }
    }
}

fn tool_event(session: &str) -> Value {
    json!({
        "source_app": "/work/app",
        "session_id": session,
        "hook_event_type": "PostToolUse",
        "payload": {"tool_name": "Bash", "tokens_used": 5}
    })
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;
    let health = server.get_json("/health").await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["clients"], 0);
}

#[tokio::test]
async fn test_ingest_and_stats() {
    let server = TestServer::start().await;

    for session in ["s1", "s1", "s1", "s2", "s2"] {
        let response = server.post_event(tool_event(session)).await;
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], true);
    }

    let stats = server.get_json("/stats").await;
    assert_eq!(stats["sessions"], 2);
    assert_eq!(stats["total_events"], 5);
    assert_eq!(stats["tokens_used"], 25);

    let s1 = server.get_json("/stats?session_id=s1").await;
    assert_eq!(s1["total_events"], 3);

    let recent = server.get_json("/events/recent?limit=2").await;
    assert_eq!(recent.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_confidence_verdicts_are_annotated() {
    let server = TestServer::start().await;
    let mut ws = server.connect_stream().await;

    for confidence in [0.85, 0.65, 0.3] {
        let response = server
            .post_event(json!({
                "source_app": "/work/app",
                "session_id": "s1",
                "hook_event_type": "ProtocolEvent",
                "payload": {"agent_type": "planner", "phase": 1, "confidence": confidence}
            }))
            .await;
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    }

    let mut verdicts = Vec::new();
    for _ in 0..3 {
        match next_message(&mut ws).await {
            StreamMessage::Event { data } => {
                let verdict = data.field("verdict").and_then(Value::as_str).unwrap();
                let blocking = data.field("blocking").and_then(Value::as_bool).unwrap();
                verdicts.push((verdict.to_string(), blocking));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    assert_eq!(
        verdicts,
        vec![
            ("proceed".to_string(), false),
            ("clarify".to_string(), false),
            ("block".to_string(), true),
        ]
    );
}

#[tokio::test]
async fn test_delete_session_broadcasts() {
    let server = TestServer::start().await;
    server.post_event(tool_event("s1")).await;
    server.post_event(tool_event("s2")).await;

    let mut ws = server.connect_stream().await;

    let response = server
        .http
        .delete(server.url("/sessions/s1"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["deleted"], 1);

    match next_message(&mut ws).await {
        StreamMessage::SessionDeleted { session_id } => assert_eq!(session_id, "s1"),
        other => panic!("unexpected message: {:?}", other),
    }

    let stats = server.get_json("/stats").await;
    assert_eq!(stats["sessions"], 1);
}

#[tokio::test]
async fn test_clear_broadcasts() {
    let server = TestServer::start().await;
    server.post_event(tool_event("s1")).await;
    let mut ws = server.connect_stream().await;

    let response = server
        .http
        .post(server.url("/events/clear"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(next_message(&mut ws).await, StreamMessage::EventsCleared);
    assert_eq!(server.ingestor.store().count().unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let server = TestServer::start().await;

    let response = server
        .http
        .post(server.url("/events"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = server
        .post_event(json!({"source_app": "/work/app", "hook_event_type": "PostToolUse"}))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);

    assert_eq!(server.ingestor.store().count().unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_route() {
    let server = TestServer::start().await;
    let response = server.http.get(server.url("/nope")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::start().await;
    let mut ws = server.connect_stream().await;

    ws.send(Message::text(StreamMessage::Ping.to_frame().unwrap()))
        .await
        .unwrap();
    assert_eq!(next_message(&mut ws).await, StreamMessage::Pong);
}

#[tokio::test]
async fn test_stream_counts_clients() {
    let server = TestServer::start().await;
    let _a = server.connect_stream().await;
    let _b = server.connect_stream().await;

    let health = server.get_json("/health").await;
    assert_eq!(health["clients"], 2);
}
