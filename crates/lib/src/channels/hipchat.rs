//! HipChat v2 REST client: room notifications and room listing.

use crate::channels::notifier::{Notification, RoomNotifier};
use async_trait::async_trait;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.hipchat.com/v2";

/// A room as returned by `GET /room`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Room {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct RoomsPage {
    #[serde(default)]
    items: Vec<Room>,
    #[serde(default)]
    links: Option<PageLinks>,
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HipChatError {
    #[error("hipchat request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("hipchat api error: {0}")]
    Api(String),
}

/// Client for the HipChat v2 API, authenticated with a bearer token.
#[derive(Clone)]
pub struct HipChatClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HipChatClient {
    pub fn new(base_url: Option<String>, token: String, client: reqwest::Client) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            token,
            client,
        }
    }

    /// POST /room/{id}/notification. HipChat answers 204 on success.
    pub async fn send_notification(
        &self,
        room_id: i64,
        notification: &Notification,
    ) -> Result<(), HipChatError> {
        let url = format!("{}/room/{}/notification", self.base_url, room_id);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(notification)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(HipChatError::Api(format!(
                "notification to room {} failed: {} {}",
                room_id, status, body
            )));
        }
        Ok(())
    }

    /// GET /room, following `links.next` until the last page.
    pub async fn list_rooms(&self) -> Result<Vec<Room>, HipChatError> {
        let mut rooms = Vec::new();
        let mut next = Some(format!("{}/room", self.base_url));
        while let Some(url) = next.take() {
            let res = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await?;
            if !res.status().is_success() {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                return Err(HipChatError::Api(format!(
                    "listing rooms failed: {} {}",
                    status, body
                )));
            }
            let page: RoomsPage = res.json().await?;
            if page.items.is_empty() {
                break;
            }
            rooms.extend(page.items);
            next = page.links.and_then(|l| l.next).filter(|n| *n != url);
        }
        Ok(rooms)
    }
}

#[async_trait]
impl RoomNotifier for HipChatClient {
    async fn notify(&self, room_id: i64, notification: &Notification) -> Result<(), String> {
        self.send_notification(room_id, notification)
            .await
            .map_err(|e| e.to_string())
    }
}
