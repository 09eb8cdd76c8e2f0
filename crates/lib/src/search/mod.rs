//! Image search: query and result types, and the `ImageSearch` seam the relay calls through.

mod bing;

pub use bing::{BingClient, BingError};

use async_trait::async_trait;

/// One image search: the text to look up and the adult-content filter level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageQuery {
    pub query: String,
    pub safe_search: String,
}

/// A candidate image. `media_url` points at the full-size image, not a thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResult {
    pub media_url: String,
}

/// Runs image searches. Errors are the service's failure text.
#[async_trait]
pub trait ImageSearch: Send + Sync {
    async fn search_images(&self, query: &ImageQuery) -> Result<Vec<ImageResult>, String>;
}
