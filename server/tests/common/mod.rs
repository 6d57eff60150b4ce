//! Shared helpers: boot the real router on an ephemeral port and drive it
//! over HTTP and WebSocket.

#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use forum_server::config::RealtimeConfig;
use forum_server::state::{AppState, AuthRateLimit};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWrite = SplitSink<WsStream, Message>;
pub type WsRead = SplitStream<WsStream>;

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
}

/// Start the server on a random port with a throwaway data dir.
pub async fn start_test_server(announce_presence: bool) -> TestServer {
    // Tests register and log in far faster than the production limit allows
    boot(
        announce_presence,
        AuthRateLimit {
            burst_size: 1000,
            replenish_secs: 1,
        },
    )
    .await
}

/// Server whose auth routes allow only `burst` requests per peer.
pub async fn start_test_server_with_auth_burst(burst: u32) -> TestServer {
    boot(
        false,
        AuthRateLimit {
            burst_size: burst,
            replenish_secs: 60,
        },
    )
    .await
}

async fn boot(announce_presence: bool, auth_rate_limit: AuthRateLimit) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = forum_server::db::init_db(&data_dir).expect("Failed to init DB");
    let hub = forum_server::ws::spawn_hub(announce_presence);

    let state = AppState {
        db,
        hub,
        session_ttl_hours: 1,
        secure_cookies: false,
        auth_rate_limit,
        realtime: RealtimeConfig {
            announce_presence,
            ..RealtimeConfig::default()
        },
    };

    let app = forum_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn register(&self, nickname: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/auth/register"))
            .json(&json!({
                "first_name": "Test",
                "last_name": "User",
                "email": format!("{}@example.com", nickname),
                "gender": "other",
                "age": 30,
                "nickname": nickname,
                "password": "password123",
            }))
            .send()
            .await
            .unwrap()
    }

    pub async fn login(&self, identifier: &str, password: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/auth/login"))
            .json(&json!({ "identifier": identifier, "password": password }))
            .send()
            .await
            .unwrap()
    }

    /// Register `nickname`, log in, and return (user_id, cookie pair).
    pub async fn signup(&self, nickname: &str) -> (i64, String) {
        let resp = self.register(nickname).await;
        assert_eq!(resp.status(), 201, "Registration failed for {}", nickname);

        let resp = self.login(nickname, "password123").await;
        assert_eq!(resp.status(), 200, "Login failed for {}", nickname);
        let cookie = session_cookie_pair(&resp).expect("login sets a session cookie");
        let body: Value = resp.json().await.unwrap();

        (body["id"].as_i64().unwrap(), cookie)
    }

    pub async fn get(&self, path: &str, cookie: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header(reqwest::header::COOKIE, cookie)
            .send()
            .await
            .unwrap()
    }

    pub async fn post(&self, path: &str, cookie: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(reqwest::header::COOKIE, cookie)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Open a WebSocket, optionally carrying a Cookie header.
    pub async fn connect_ws(
        &self,
        cookie: Option<&str>,
    ) -> Result<WsStream, tungstenite::Error> {
        let mut request = format!("ws://{}/ws", self.addr)
            .into_client_request()
            .unwrap();
        if let Some(cookie) = cookie {
            request
                .headers_mut()
                .insert("Cookie", cookie.parse().unwrap());
        }
        tokio_tungstenite::connect_async(request)
            .await
            .map(|(stream, _)| stream)
    }

    /// Connect and split, panicking on failure.
    pub async fn open_ws(&self, cookie: &str) -> (WsWrite, WsRead) {
        self.connect_ws(Some(cookie))
            .await
            .expect("WebSocket upgrade failed")
            .split()
    }

    /// Poll the online list until it holds `count` users.
    pub async fn wait_for_online(&self, cookie: &str, count: usize) {
        for _ in 0..50 {
            let users: Vec<Value> = self.get("/api/users/online", cookie).await.json().await.unwrap();
            if users.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("online user count never reached {}", count);
    }
}

/// "session_token=<value>" from a login response.
pub fn session_cookie_pair(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("session_token="))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

pub async fn send_json(write: &mut WsWrite, value: Value) {
    write
        .send(Message::text(value.to_string()))
        .await
        .expect("WebSocket send failed");
}

/// Next text frame decoded as JSON, or None on timeout/close.
pub async fn next_json(read: &mut WsRead, wait: Duration) -> Option<Value> {
    loop {
        match tokio::time::timeout(wait, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str(text.as_str()).expect("server sent invalid JSON"));
            }
            // Control frames are not envelopes
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// Skip frames until one with the given envelope type arrives.
pub async fn next_of_type(read: &mut WsRead, kind: &str) -> Value {
    loop {
        let frame = next_json(read, Duration::from_secs(5))
            .await
            .unwrap_or_else(|| panic!("no {} frame received", kind));
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Skip frames until an online_users snapshot satisfying `accept` arrives.
pub async fn next_presence_where(read: &mut WsRead, accept: impl Fn(&[Value]) -> bool) -> Vec<Value> {
    loop {
        let frame = next_of_type(read, "online_users").await;
        let users = frame["payload"].as_array().cloned().unwrap_or_default();
        if accept(&users) {
            return users;
        }
    }
}
