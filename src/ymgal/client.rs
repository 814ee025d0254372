use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::RwLock;

use super::error::HttpFailure;
use super::types::{RawResponse, SearchHit, TokenResponse, parse_search_body};
use crate::config::ApiConfig;
use crate::engine::Query;

const TOKEN_PATH: &str = "/oauth/token";
const SEARCH_PATH: &str = "/open/archive/search-game";
const PAGE_SIZE: &str = "20";

/// Fetches search results for one work item. One call per attempt.
pub trait ApiClient: Send + Sync + 'static {
    fn fetch(&self, query: &Query) -> impl Future<Output = Result<RawResponse, HttpFailure>> + Send;
}

/// reqwest-backed client for the YMGal open archive.
pub struct YmgalClient {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<String>>,
}

impl YmgalClient {
    pub fn new(config: &ApiConfig) -> Result<Self, HttpFailure> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: RwLock::new(None),
        })
    }

    /// Requests a fresh access token (OAuth2 client credentials, `public` scope)
    /// and stores it for subsequent searches.
    pub async fn authenticate(&self) -> Result<String, HttpFailure> {
        let response = self
            .client
            .post(format!("{}{TOKEN_PATH}", self.base_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "public"),
            ])
            .send()
            .await?;

        let status = response.status();
        if let Some(throttled) = throttled(&response) {
            return Err(throttled);
        }
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let message = response.text().await.unwrap_or_default();
            return Err(HttpFailure::Unauthorized(format!("token request rejected: {message}")));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HttpFailure::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<TokenResponse>().await?;
        *self.token.write().await = Some(body.access_token.clone());
        tracing::debug!("obtained archive access token");
        Ok(body.access_token)
    }

    async fn current_token(&self) -> Result<String, HttpFailure> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.authenticate().await
    }

    /// Refreshes the token unless another request already replaced `stale`.
    async fn refresh(&self, stale: &str) -> Result<String, HttpFailure> {
        {
            let current = self.token.read().await;
            if let Some(token) = current.as_deref() {
                if token != stale {
                    return Ok(token.to_string());
                }
            }
        }
        tracing::info!("access token rejected, refreshing");
        self.authenticate().await
    }

    async fn search_once(&self, keyword: &str, token: &str) -> Result<Value, HttpFailure> {
        let response = self
            .client
            .get(format!("{}{SEARCH_PATH}", self.base_url))
            .query(&[
                ("mode", "list"),
                ("keyword", keyword),
                ("pageNum", "1"),
                ("pageSize", PAGE_SIZE),
                ("includeOrg", "true"),
            ])
            .bearer_auth(token)
            .header("accept", "application/json")
            .header("version", "1")
            .send()
            .await?;

        if let Some(throttled) = throttled(&response) {
            return Err(throttled);
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(HttpFailure::Unauthorized("search rejected the access token".into()));
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(HttpFailure::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<Value>().await?)
    }

    /// Searches one keyword, refreshing the token once on a 401.
    pub async fn search(&self, keyword: &str) -> Result<Vec<super::Candidate>, HttpFailure> {
        let token = self.current_token().await?;
        let body = match self.search_once(keyword, &token).await {
            Err(HttpFailure::Unauthorized(_)) => {
                let fresh = self.refresh(&token).await?;
                self.search_once(keyword, &fresh).await?
            }
            other => other?,
        };
        parse_search_body(&body).map_err(|e| HttpFailure::Decode(e.to_string()))
    }
}

impl ApiClient for YmgalClient {
    async fn fetch(&self, query: &Query) -> Result<RawResponse, HttpFailure> {
        let mut hits = Vec::with_capacity(query.keywords.len());
        for keyword in &query.keywords {
            let candidates = self.search(&keyword.text).await?;
            hits.push(SearchHit {
                keyword: keyword.clone(),
                candidates,
            });
        }
        Ok(RawResponse { hits })
    }
}

fn throttled(response: &reqwest::Response) -> Option<HttpFailure> {
    let status = response.status();
    if status != StatusCode::SERVICE_UNAVAILABLE && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    Some(HttpFailure::RateLimited { retry_after })
}
