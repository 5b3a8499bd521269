//! Fetch types for feedmon.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::FeedmonError;

/// Options forwarded with a fetch.
///
/// Headers are opaque: they are sent verbatim and never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Conditional-fetch headers (e.g. `If-None-Match`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Total request timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Body of a fetch-request queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequestMessage {
    /// Correlation id, unique per logical fetch attempt.
    pub request_id: String,
    /// Target URL.
    pub url: String,
    /// Fetch options.
    #[serde(default)]
    pub options: FetchOptions,
}

impl FetchRequestMessage {
    /// Create a message with a fresh correlation id.
    pub fn new(url: impl Into<String>, options: FetchOptions) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            options,
        }
    }
}

/// Classification of a fetch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    /// 2xx or 304 Not Modified.
    Ok,
    /// Any other HTTP status.
    HttpError,
    /// DNS, connect, TLS or refused target.
    ConnectionError,
    /// Connect or total timeout elapsed.
    Timeout,
    /// Body exceeded the size ceiling.
    TooLarge,
    /// Content type is not a feed type.
    UnsupportedContentType,
}

impl FetchStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::HttpError => "http_error",
            FetchStatus::ConnectionError => "connection_error",
            FetchStatus::Timeout => "timeout",
            FetchStatus::TooLarge => "too_large",
            FetchStatus::UnsupportedContentType => "unsupported_content_type",
        }
    }

    /// Whether the outcome counts as a success for failure tracking.
    pub fn is_success(&self) -> bool {
        matches!(self, FetchStatus::Ok)
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchStatus {
    type Err = FeedmonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(FetchStatus::Ok),
            "http_error" => Ok(FetchStatus::HttpError),
            "connection_error" => Ok(FetchStatus::ConnectionError),
            "timeout" => Ok(FetchStatus::Timeout),
            "too_large" => Ok(FetchStatus::TooLarge),
            "unsupported_content_type" => Ok(FetchStatus::UnsupportedContentType),
            other => Err(FeedmonError::Validation(format!(
                "unknown fetch status: {other}"
            ))),
        }
    }
}

/// Result of one HTTP retrieval, before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Classification.
    pub status: FetchStatus,
    /// HTTP status code, if a response was received.
    pub http_status: Option<u16>,
    /// SHA-256 hex digest of the body (successful fetches only).
    pub content_hash: Option<String>,
    /// Wall time spent on the fetch.
    pub latency_ms: u64,
    /// Human readable failure detail.
    pub error_message: Option<String>,
}

impl FetchOutcome {
    /// A failure outcome without an HTTP status.
    pub fn failure(status: FetchStatus, latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status,
            http_status: None,
            content_hash: None,
            latency_ms,
            error_message: Some(message.into()),
        }
    }
}

/// A persisted fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Row ID.
    pub id: i64,
    /// Correlation id from the originating message.
    pub correlation_id: String,
    /// Target URL.
    pub url: String,
    /// Options the fetch was made with.
    pub options: FetchOptions,
    /// When the request was recorded.
    pub created_at: DateTime<Utc>,
}

/// A persisted fetch outcome.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Row ID.
    pub id: i64,
    /// Owning request row ID.
    pub request_id: i64,
    /// Classification.
    pub status: FetchStatus,
    /// HTTP status code.
    pub http_status: Option<u16>,
    /// Body digest.
    pub content_hash: Option<String>,
    /// Latency in milliseconds.
    pub latency_ms: i64,
    /// Failure detail.
    pub error_message: Option<String>,
    /// When the outcome was recorded.
    pub created_at: DateTime<Utc>,
}

impl FetchResponse {
    /// Whether this response counts as a success.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
