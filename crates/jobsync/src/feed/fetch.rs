//! Retrieving raw feed payloads.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;

use super::FeedSource;
use crate::error::FeedError;
use crate::sanitize::redact_url;

/// Default connect timeout for feed requests (10 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout for feed requests (30 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.9, */*;q=0.5";

/// A successful response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFeed {
    pub body: String,
    pub content_type: Option<String>,
    pub status: u16,
}

/// Fetches the raw payload for a source.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source: &FeedSource) -> Result<FetchedFeed, FeedError>;
}

/// `FeedFetcher` over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFeedFetcher {
    client: Client,
}

impl HttpFeedFetcher {
    pub fn new() -> Result<Self, FeedError> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FeedError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .user_agent(default_user_agent())
            .build()
            .map_err(|e| FeedError::Fetch {
                url: String::new(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

fn default_user_agent() -> String {
    format!("jobsync/{}", env!("CARGO_PKG_VERSION"))
}

/// Builds request headers: defaults first, then the source's own headers.
pub fn request_headers(source: &FeedSource) -> Result<HeaderMap, FeedError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));

    for (name, value) in &source.headers {
        let invalid = |reason: String| FeedError::Fetch {
            url: redact_url(&source.url),
            reason,
        };
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| invalid(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| invalid(format!("invalid value for header '{}': {}", name, e)))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, source: &FeedSource) -> Result<FetchedFeed, FeedError> {
        let url = redact_url(&source.url);
        let headers = request_headers(source)?;
        debug!(
            "Fetching feed '{}' from {} (custom user agent: {})",
            source.name,
            url,
            headers.contains_key(USER_AGENT)
        );

        let response = self
            .client
            .get(&source.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| FeedError::Fetch {
                url: url.clone(),
                reason: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.text().await.map_err(|e| FeedError::Fetch {
            url: url.clone(),
            reason: format!("failed to read body: {}", e.without_url()),
        })?;

        debug!("Fetched {} bytes from {}", body.len(), url);

        Ok(FetchedFeed {
            body,
            content_type,
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_defaults_and_overrides() {
        let source = FeedSource::new("jobicy_all", "https://jobicy.com/?feed=job_feed")
            .with_header("User-Agent", "Mozilla/5.0")
            .with_header("Accept", "application/rss+xml");
        let headers = request_headers(&source).unwrap();
        assert_eq!(headers[USER_AGENT], "Mozilla/5.0");
        assert_eq!(headers[ACCEPT], "application/rss+xml");
    }

    #[test]
    fn test_request_headers_default_accept() {
        let source = FeedSource::new("higheredjobs", "https://example.com/rss");
        let headers = request_headers(&source).unwrap();
        assert!(headers[ACCEPT].to_str().unwrap().contains("rss+xml"));
        assert!(!headers.contains_key(USER_AGENT));
    }

    #[test]
    fn test_invalid_header_is_fetch_error() {
        let source = FeedSource::new("jobicy_all", "https://example.com/rss")
            .with_header("Bad Header", "x");
        assert!(matches!(
            request_headers(&source),
            Err(FeedError::Fetch { .. })
        ));
    }

    #[test]
    fn test_http_fetcher_builds() {
        assert!(HttpFeedFetcher::new().is_ok());
        assert!(HttpFeedFetcher::with_timeout(Duration::from_secs(2)).is_ok());
    }
}
