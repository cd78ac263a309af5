use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

use crate::storage::Podcast;

/// Default cap on a feed body.
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Default per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Only feed documents are acceptable responses.
const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml;q=0.9, \
                           application/rdf+xml;q=0.8, application/xml;q=0.7, text/xml;q=0.6";

/// HTTP-date layout for `If-Modified-Since`.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Why a feed could not be retrieved this time around.
///
/// All variants are transient: the podcast is retried on a later run.
#[derive(Debug, Error)]
pub enum UnavailableReason {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with an error status other than 410
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Non-success fetch outcomes.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP 304, or a body identical to the last one stored
    #[error("Not modified")]
    NotModified,
    /// HTTP 410: the publisher has taken the feed down for good
    #[error("Feed discontinued (HTTP 410)")]
    Discontinued,
    #[error("Feed unavailable: {0}")]
    Unavailable(#[from] UnavailableReason),
}

/// Per-request limits, normally taken from the config file.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub max_feed_size: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: REQUEST_TIMEOUT,
            max_feed_size: MAX_FEED_SIZE,
        }
    }
}

/// A feed body retrieved with a 2xx response.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    /// URL after following redirects.
    pub final_url: String,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    /// See [`content_hash`].
    pub content_hash: String,
}

/// Build the HTTP client shared by all workers.
pub fn build_client(user_agent: &str) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
}

/// Hex SHA-256 of `body` with surrounding ASCII whitespace removed.
///
/// An empty or all-whitespace body hashes to `""`, which never matches a
/// stored hash.
pub fn content_hash(body: &[u8]) -> String {
    let trimmed = body.trim_ascii();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{:x}", Sha256::digest(trimmed))
}

/// Conditionally GET the podcast's feed.
///
/// # Errors
///
/// - [`FetchError::NotModified`] on 304 or an unchanged content hash
/// - [`FetchError::Discontinued`] on 410
/// - [`FetchError::Unavailable`] for every other failure
pub async fn fetch(
    client: &reqwest::Client,
    podcast: &Podcast,
    options: FetchOptions,
) -> Result<FetchedFeed, FetchError> {
    // The timeout covers the body download too; a slow trickle must not pin a worker.
    tokio::time::timeout(options.timeout, fetch_inner(client, podcast, options))
        .await
        .map_err(|_| UnavailableReason::Timeout)?
}

async fn fetch_inner(
    client: &reqwest::Client,
    podcast: &Podcast,
    options: FetchOptions,
) -> Result<FetchedFeed, FetchError> {
    let mut request = client.get(&podcast.rss).header(ACCEPT, FEED_ACCEPT);
    if let Some(etag) = podcast.etag.as_deref().filter(|e| !e.is_empty()) {
        request = request.header(IF_NONE_MATCH, etag);
    }
    if let Some(modified) = podcast.modified {
        request = request.header(
            IF_MODIFIED_SINCE,
            modified.format(HTTP_DATE_FORMAT).to_string(),
        );
    }

    let response = request.send().await.map_err(UnavailableReason::Network)?;

    match response.status() {
        StatusCode::NOT_MODIFIED => return Err(FetchError::NotModified),
        StatusCode::GONE => return Err(FetchError::Discontinued),
        status if !status.is_success() => {
            return Err(UnavailableReason::HttpStatus(status.as_u16()).into())
        }
        _ => {}
    }

    let final_url = response.url().to_string();
    let headers = response.headers();
    let etag = headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    // Garbled Last-Modified values are ignored rather than failing the fetch.
    let modified = headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let body = read_limited_bytes(response, options.max_feed_size).await?;

    let hash = content_hash(&body);
    if !hash.is_empty() && podcast.content_hash.as_deref() == Some(hash.as_str()) {
        return Err(FetchError::NotModified);
    }

    Ok(FetchedFeed {
        final_url,
        body,
        etag,
        modified,
        content_hash: hash,
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, UnavailableReason> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(UnavailableReason::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(UnavailableReason::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(UnavailableReason::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
