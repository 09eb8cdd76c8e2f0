//! Bing Image Search API v7 client (https://api.bing.microsoft.com/v7.0 by default).

use crate::search::{ImageQuery, ImageResult, ImageSearch};
use async_trait::async_trait;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.bing.microsoft.com/v7.0";
const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Client for Bing image search, authenticated with a subscription (account) key.
#[derive(Clone)]
pub struct BingClient {
    base_url: String,
    account_key: String,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum BingError {
    #[error("bing request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("bing api error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    value: Vec<ImageObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageObject {
    #[serde(default)]
    content_url: Option<String>,
}

impl ImagesResponse {
    /// Entries without a content URL are dropped; order is the service's ranking.
    fn into_results(self) -> Vec<ImageResult> {
        self.value
            .into_iter()
            .filter_map(|img| img.content_url)
            .filter(|url| !url.trim().is_empty())
            .map(|media_url| ImageResult { media_url })
            .collect()
    }
}

impl BingClient {
    pub fn new(base_url: Option<String>, account_key: String, client: reqwest::Client) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            account_key,
            client,
        }
    }

    /// GET /images/search?q=..&safeSearch=..
    pub async fn search(&self, query: &ImageQuery) -> Result<Vec<ImageResult>, BingError> {
        let url = format!("{}/images/search", self.base_url);
        let res = self
            .client
            .get(&url)
            .query(&[
                ("q", query.query.as_str()),
                ("safeSearch", query.safe_search.as_str()),
            ])
            .header(SUBSCRIPTION_KEY_HEADER, &self.account_key)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BingError::Api(format!("{} {}", status, body)));
        }
        let data: ImagesResponse = res.json().await?;
        Ok(data.into_results())
    }
}

#[async_trait]
impl ImageSearch for BingClient {
    async fn search_images(&self, query: &ImageQuery) -> Result<Vec<ImageResult>, String> {
        self.search(query).await.map_err(|e| e.to_string())
    }
}
