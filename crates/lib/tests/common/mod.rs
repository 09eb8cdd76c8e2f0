//! Shared helpers: free ports, a mock Bing + HipChat upstream, and a relay config pointing at it.
#![allow(dead_code)]

use adblocks_lib::config::Config;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BING_KEY: &str = "test-bing-key";
pub const HIPCHAT_TOKEN: &str = "test-hipchat-token";

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Poll until something accepts connections on `addr` (5s max).
pub async fn wait_for_listener(addr: &str) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("nothing listening on {} within 5s", addr);
}

#[derive(Debug, Clone)]
pub struct SearchCall {
    pub params: HashMap<String, String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotifyCall {
    pub room_id: i64,
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

/// Bing and HipChat stand-ins on one local port, recording every call.
#[derive(Clone)]
pub struct MockUpstream {
    pub image_urls: Vec<String>,
    pub search_status: StatusCode,
    pub notify_status: StatusCode,
    pub rooms_status: StatusCode,
    pub searches: Arc<Mutex<Vec<SearchCall>>>,
    pub notifications: Arc<Mutex<Vec<NotifyCall>>>,
}

impl MockUpstream {
    pub fn with_images(urls: &[&str]) -> Self {
        Self {
            image_urls: urls.iter().map(|u| u.to_string()).collect(),
            search_status: StatusCode::OK,
            notify_status: StatusCode::NO_CONTENT,
            rooms_status: StatusCode::OK,
            searches: Arc::new(Mutex::new(Vec::new())),
            notifications: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn searches(&self) -> Vec<SearchCall> {
        self.searches.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<NotifyCall> {
        self.notifications.lock().unwrap().clone()
    }

    /// Serve on a free port; returns the address.
    pub async fn start(&self) -> SocketAddr {
        let app = Router::new()
            .route("/bing/v7.0/images/search", get(bing_search))
            .route("/hipchat/v2/room", get(hipchat_rooms))
            .route("/hipchat/v2/room/:id/notification", post(hipchat_notify))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }
}

async fn bing_search(
    State(mock): State<MockUpstream>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    let key = headers
        .get("Ocp-Apim-Subscription-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    mock.searches.lock().unwrap().push(SearchCall { params, key });
    if !mock.search_status.is_success() {
        return (
            mock.search_status,
            Json(json!({ "errors": [{ "message": "Access denied" }] })),
        );
    }
    let value: Vec<serde_json::Value> = mock
        .image_urls
        .iter()
        .map(|u| json!({ "name": "img", "thumbnailUrl": "https://tse.example/t", "contentUrl": u }))
        .collect();
    (StatusCode::OK, Json(json!({ "_type": "Images", "value": value })))
}

async fn hipchat_notify(
    State(mock): State<MockUpstream>,
    Path(room_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, String) {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    mock.notifications.lock().unwrap().push(NotifyCall {
        room_id,
        authorization,
        body,
    });
    if mock.notify_status.is_success() {
        (mock.notify_status, String::new())
    } else {
        (mock.notify_status, "Room not found".to_string())
    }
}

/// Two pages of rooms: the first links to the second through `links.next`.
async fn hipchat_rooms(
    State(mock): State<MockUpstream>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    if !mock.rooms_status.is_success() {
        return (
            mock.rooms_status,
            Json(json!({ "error": { "message": "Invalid OAuth session" } })),
        );
    }
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let page = match params.get("start-index").map(String::as_str) {
        Some("2") => json!({
            "items": [{ "id": 3, "name": "Lobby" }],
            "links": { "self": format!("http://{}/hipchat/v2/room?start-index=2", host) }
        }),
        _ => json!({
            "items": [{ "id": 1, "name": "Ops" }, { "id": 2, "name": "Dev" }],
            "links": {
                "self": format!("http://{}/hipchat/v2/room", host),
                "next": format!("http://{}/hipchat/v2/room?start-index=2", host)
            }
        }),
    };
    (StatusCode::OK, Json(page))
}

/// Relay config with credentials and both base URLs pointing at the mock.
pub fn relay_config(upstream: SocketAddr) -> Config {
    let mut config = Config::default();
    config.bing.account_key = Some(BING_KEY.to_string());
    config.bing.base_url = Some(format!("http://{}/bing/v7.0", upstream));
    config.hipchat.token = Some(HIPCHAT_TOKEN.to_string());
    config.hipchat.base_url = Some(format!("http://{}/hipchat/v2", upstream));
    config.http.timeout_secs = 5;
    config
}

pub const CATS_EVENT: &str = r#"{"item":{"room":{"id":42},"message":{"message":"cats"}}}"#;
