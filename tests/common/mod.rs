#![allow(dead_code)]

use std::time::Duration;

use axum::body::Body;
use futures_util::StreamExt;
use http::{Method, Request};
use intelhub::config::{Config, HubConfig};
use intelhub::routes;
use intelhub::state::AppState;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const JWT_SECRET: &str = "test-secret";
pub const PUBLISH_KEY: &str = "test-publish-key";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test server owning its own hub. Each instance is isolated, so tests can
/// run in parallel.
pub struct TestServer {
    pub state: AppState,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_hub(HubConfig::default()).await
    }

    pub async fn with_hub(hub: HubConfig) -> Self {
        let config = Config {
            port: 0,
            jwt_secret: JWT_SECRET.to_string(),
            publish_key: Some(PUBLISH_KEY.to_string()),
            publish_rate_limit: 120,
            hub,
        };
        Self::with_config(config).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self {
            state: AppState::new(config),
        }
    }

    /// Returns an Axum Router wired to this server's state for `oneshot()` calls.
    pub fn router(&self) -> axum::Router {
        routes::router(self.state.clone())
    }

    /// A credential for `user_id` signed with the server's secret.
    pub fn token_for(&self, user_id: &str) -> String {
        self.state
            .auth
            .issue(user_id, Duration::from_secs(3600))
            .unwrap()
    }

    pub fn auth_header(&self, user_id: &str) -> String {
        format!("Bearer {}", self.token_for(user_id))
    }

    /// Binds a TCP listener on port 0, spawns the server, and returns the base URL.
    pub async fn spawn(&self) -> String {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("127.0.0.1:{}", addr.port())
    }

    /// Open `/ws` as `user_id` and consume the ready frame.
    pub async fn connect(&self, addr: &str, user_id: &str) -> (WsClient, serde_json::Value) {
        let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Authorization", self.auth_header(user_id).parse().unwrap());
        let (mut ws, _) = connect_async(request).await.unwrap();
        let ready = next_json(&mut ws).await;
        assert_eq!(ready["type"], "ready", "expected ready frame, got {ready}");
        (ws, ready)
    }
}

/// Next text frame as JSON, skipping heartbeat pings. Panics after 5s.
pub async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["type"] != "ping" {
                    return value;
                }
            }
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

/// Read until the server closes, returning the close code if one was sent.
pub async fn expect_close(ws: &mut WsClient) -> Option<u16> {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

pub fn text(value: serde_json::Value) -> Message {
    Message::Text(value.to_string().into())
}

// ---------------------------------------------------------------------------
// Request builder helpers
// ---------------------------------------------------------------------------

/// Build an authenticated request with no body.
pub fn authenticated_request(method: Method, uri: &str, auth_header: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", auth_header)
        .body(Body::empty())
        .unwrap()
}

/// Build a publish request carrying the given producer key.
pub fn publish_request(key: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/publish")
        .header("Content-Type", "application/json");
    if let Some(key) = key {
        builder = builder.header("X-Publish-Key", key);
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Parse a response body into a `serde_json::Value`.
pub async fn parse_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
