//! Integration tests: room listing against the mock HipChat API.

mod common;

use adblocks_lib::channels::{HipChatClient, HipChatError};
use axum::http::StatusCode;
use common::{MockUpstream, HIPCHAT_TOKEN};

fn client_for(upstream: std::net::SocketAddr) -> HipChatClient {
    HipChatClient::new(
        Some(format!("http://{}/hipchat/v2/", upstream)),
        HIPCHAT_TOKEN.to_string(),
        reqwest::Client::new(),
    )
}

#[tokio::test]
async fn list_rooms_follows_next_links() {
    let mock = MockUpstream::with_images(&[]);
    let upstream = mock.start().await;

    let rooms = client_for(upstream).list_rooms().await.expect("list rooms");
    let listed: Vec<(i64, &str)> = rooms.iter().map(|r| (r.id, r.name.as_str())).collect();
    assert_eq!(listed, vec![(1, "Ops"), (2, "Dev"), (3, "Lobby")]);
}

#[tokio::test]
async fn list_rooms_reports_api_errors() {
    let mut mock = MockUpstream::with_images(&[]);
    mock.rooms_status = StatusCode::UNAUTHORIZED;
    let upstream = mock.start().await;

    match client_for(upstream).list_rooms().await {
        Err(HipChatError::Api(message)) => {
            assert!(message.contains("401"), "got {:?}", message);
            assert!(message.contains("Invalid OAuth session"));
        }
        other => panic!("expected an api error, got {:?}", other),
    }
}
