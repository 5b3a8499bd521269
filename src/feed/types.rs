//! Feed types for feedmon.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::fetch::FetchOptions;
use crate::FeedmonError;

/// Health status of a feed.
///
/// Automatic transitions only move forward to `Disabled`; leaving
/// `Disabled` requires an explicit re-enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedStatus {
    /// Fetching normally.
    Ok,
    /// Recent fetches failed, threshold not yet reached.
    Failing,
    /// Disabled after a sustained failure window.
    Disabled,
}

impl FeedStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Ok => "ok",
            FeedStatus::Failing => "failing",
            FeedStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedStatus {
    type Err = FeedmonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(FeedStatus::Ok),
            "failing" => Ok(FeedStatus::Failing),
            "disabled" => Ok(FeedStatus::Disabled),
            other => Err(FeedmonError::Validation(format!(
                "unknown feed status: {other}"
            ))),
        }
    }
}

/// A feed scheduled for fetching.
#[derive(Debug, Clone)]
pub struct Feed {
    /// Feed ID.
    pub id: i64,
    /// Feed URL.
    pub url: String,
    /// Feed title.
    pub title: String,
    /// Minimum seconds between two enqueued fetches.
    pub refresh_rate_seconds: i64,
    /// Health status.
    pub status: FeedStatus,
    /// Why the feed was disabled.
    pub disabled_reason: Option<String>,
    /// Conditional-fetch headers forwarded to the HTTP client.
    pub fetch_headers: BTreeMap<String, String>,
    /// Per-feed request timeout override in seconds.
    pub request_timeout_secs: Option<u64>,
    /// When a fetch request for this feed was last enqueued.
    pub last_enqueued_at: Option<DateTime<Utc>>,
    /// When the feed was created.
    pub created_at: DateTime<Utc>,
    /// When the feed was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Feed {
    /// Check if the feed should be enqueued at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status == FeedStatus::Disabled {
            return false;
        }
        match self.last_enqueued_at {
            None => true,
            Some(last) => now.signed_duration_since(last).num_seconds() >= self.refresh_rate_seconds,
        }
    }

    /// Options for a fetch of this feed.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            headers: self.fetch_headers.clone(),
            timeout_secs: self.request_timeout_secs,
        }
    }
}

/// New feed for creation.
#[derive(Debug, Clone)]
pub struct NewFeed {
    /// Feed URL.
    pub url: String,
    /// Feed title.
    pub title: String,
    /// Refresh rate in seconds.
    pub refresh_rate_seconds: i64,
    /// Conditional-fetch headers.
    pub fetch_headers: BTreeMap<String, String>,
    /// Request timeout override in seconds.
    pub request_timeout_secs: Option<u64>,
}

impl NewFeed {
    /// Create a new feed.
    pub fn new(url: impl Into<String>, title: impl Into<String>, refresh_rate_seconds: i64) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            refresh_rate_seconds,
            fetch_headers: BTreeMap::new(),
            request_timeout_secs: None,
        }
    }

    /// Add a header forwarded with every fetch.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fetch_headers.insert(name.into(), value.into());
        self
    }

    /// Set the request timeout override.
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn feed(status: FeedStatus, last_enqueued_at: Option<DateTime<Utc>>) -> Feed {
        Feed {
            id: 1,
            url: "https://example.com/feed.xml".to_string(),
            title: "Test".to_string(),
            refresh_rate_seconds: 60,
            status,
            disabled_reason: None,
            fetch_headers: BTreeMap::new(),
            request_timeout_secs: None,
            last_enqueued_at,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_feed_status_round_trip() {
        for status in [FeedStatus::Ok, FeedStatus::Failing, FeedStatus::Disabled] {
            assert_eq!(status.as_str().parse::<FeedStatus>().unwrap(), status);
        }
        assert!("paused".parse::<FeedStatus>().is_err());
    }

    #[test]
    fn test_never_enqueued_feed_is_due() {
        assert!(feed(FeedStatus::Ok, None).is_due(Utc::now()));
        assert!(feed(FeedStatus::Failing, None).is_due(Utc::now()));
    }

    #[test]
    fn test_disabled_feed_is_never_due() {
        let long_ago = Utc::now() - Duration::days(30);
        assert!(!feed(FeedStatus::Disabled, None).is_due(Utc::now()));
        assert!(!feed(FeedStatus::Disabled, Some(long_ago)).is_due(Utc::now()));
    }

    #[test]
    fn test_due_after_refresh_rate() {
        let now = Utc::now();
        let f = feed(FeedStatus::Ok, Some(now));
        assert!(!f.is_due(now + Duration::seconds(30)));
        assert!(!f.is_due(now + Duration::seconds(59)));
        assert!(f.is_due(now + Duration::seconds(60)));
    }

    #[test]
    fn test_fetch_options_carry_headers() {
        let mut f = feed(FeedStatus::Ok, None);
        f.fetch_headers
            .insert("If-None-Match".to_string(), "\"abc\"".to_string());
        f.request_timeout_secs = Some(5);

        let options = f.fetch_options();
        assert_eq!(options.headers.get("If-None-Match").unwrap(), "\"abc\"");
        assert_eq!(options.timeout_secs, Some(5));
    }

    #[test]
    fn test_new_feed_builder() {
        let new_feed = NewFeed::new("https://example.com/feed.xml", "Example", 300)
            .with_header("If-Modified-Since", "Mon, 01 Jan 2024 00:00:00 GMT")
            .with_request_timeout(10);
        assert_eq!(new_feed.refresh_rate_seconds, 300);
        assert_eq!(new_feed.fetch_headers.len(), 1);
        assert_eq!(new_feed.request_timeout_secs, Some(10));
    }
}
