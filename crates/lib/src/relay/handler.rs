//! POST /adblocks/hipchat/message: search images for the message text, post one back to the room.

use crate::channels::{InboundEvent, Notification, RoomNotifier};
use crate::relay::picker::Picker;
use crate::search::{ImageQuery, ImageSearch};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

pub const ROOM_MESSAGE_ROUTE: &str = "/adblocks/hipchat/message";

/// Adult-content filter sent with every image search.
pub const MODERATION_LEVEL: &str = "Moderate";

const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

/// Everything one relay request needs; cheap to clone per request.
#[derive(Clone)]
pub struct RelayState {
    pub search: Arc<dyn ImageSearch>,
    pub notifier: Arc<dyn RoomNotifier>,
    pub picker: Arc<Picker>,
    /// Inbound bodies larger than this fail as unreadable.
    pub max_body_bytes: usize,
}

/// Why a relay request failed. Every variant is answered with 500 and its message.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("reading request body: {0}")]
    Transport(String),
    #[error("malformed room message: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("{service} failed: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },
    #[error("image search returned no results for {0:?}")]
    EmptyResults(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, PLAIN_TEXT)],
            self.to_string(),
        )
            .into_response()
    }
}

/// Axum handler. 200 with an empty text/plain body, or 500 with the error text.
pub async fn room_message(State(state): State<RelayState>, body: Body) -> Response {
    match relay_room_message(&state, body).await {
        Ok(()) => (StatusCode::OK, [(header::CONTENT_TYPE, PLAIN_TEXT)]).into_response(),
        Err(e) => {
            log::error!("room message relay failed: {}", e);
            e.into_response()
        }
    }
}

/// Body -> event -> image search -> random pick -> room notification. Any failure stops the chain.
pub async fn relay_room_message(state: &RelayState, body: Body) -> Result<(), RelayError> {
    let data = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))?;
    let event = InboundEvent::from_json(&data)?;
    log::debug!("room {} asked for {:?}", event.room_id, event.text);

    let query = ImageQuery {
        query: event.text.clone(),
        safe_search: MODERATION_LEVEL.to_string(),
    };
    let results = state
        .search
        .search_images(&query)
        .await
        .map_err(|message| RelayError::Upstream {
            service: "image search",
            message,
        })?;

    let image = state
        .picker
        .pick(&results)
        .ok_or_else(|| RelayError::EmptyResults(event.text.clone()))?;

    let notification = Notification::text(image.media_url.clone());
    state
        .notifier
        .notify(event.room_id, &notification)
        .await
        .map_err(|message| RelayError::Upstream {
            service: "room notification",
            message,
        })?;
    log::info!(
        "posted {} to room {} ({} candidates)",
        notification.message,
        event.room_id,
        results.len()
    );
    Ok(())
}
