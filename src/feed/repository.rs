//! Feed repository for feedmon.
//!
//! This is the storage side of the feed collaborator: lookups by URL,
//! eligibility listing for the schedule emitter and status writes for the
//! failure tracker and escalation handler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::types::{Feed, FeedStatus, NewFeed};
use crate::db::{format_timestamp, parse_timestamp, DbPool};
use crate::{FeedmonError, Result};

/// Columns selected for every feed query.
const FEED_COLUMNS: &str = "id, url, title, refresh_rate_seconds, status, disabled_reason, \
     fetch_headers, request_timeout_secs, last_enqueued_at, created_at, updated_at";

/// Row type for feed from database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct FeedRow {
    id: i64,
    url: String,
    title: String,
    refresh_rate_seconds: i64,
    status: String,
    disabled_reason: Option<String>,
    fetch_headers: Option<String>,
    request_timeout_secs: Option<i64>,
    last_enqueued_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<FeedRow> for Feed {
    type Error = FeedmonError;

    fn try_from(row: FeedRow) -> Result<Self> {
        let fetch_headers: BTreeMap<String, String> = match row.fetch_headers {
            Some(json) => serde_json::from_str(&json)?,
            None => BTreeMap::new(),
        };
        Ok(Feed {
            id: row.id,
            url: row.url,
            title: row.title,
            refresh_rate_seconds: row.refresh_rate_seconds,
            status: row.status.parse()?,
            disabled_reason: row.disabled_reason,
            fetch_headers,
            request_timeout_secs: row.request_timeout_secs.map(|s| s.max(0) as u64),
            last_enqueued_at: row.last_enqueued_at.and_then(|s| parse_timestamp(&s)),
            created_at: parse_timestamp(&row.created_at).unwrap_or_else(Utc::now),
            updated_at: parse_timestamp(&row.updated_at).unwrap_or_else(Utc::now),
        })
    }
}

/// Repository for feed operations.
pub struct FeedRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> FeedRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Create a new feed.
    pub async fn create(&self, feed: &NewFeed, now: DateTime<Utc>) -> Result<Feed> {
        if feed.refresh_rate_seconds <= 0 {
            return Err(FeedmonError::Validation(
                "refresh rate must be positive".to_string(),
            ));
        }
        url::Url::parse(&feed.url)
            .map_err(|e| FeedmonError::Validation(format!("invalid feed URL: {e}")))?;

        let headers = if feed.fetch_headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&feed.fetch_headers)?)
        };
        let now = format_timestamp(now);

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO feeds (url, title, refresh_rate_seconds, status, fetch_headers,
                               request_timeout_secs, created_at, updated_at)
            VALUES ($1, $2, $3, 'ok', $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(feed.refresh_rate_seconds)
        .bind(headers)
        .bind(feed.request_timeout_secs.map(|s| s as i64))
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| FeedmonError::Database(e.to_string()))?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| FeedmonError::NotFound("feed".into()))
    }

    /// Get a feed by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Feed>> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = $1");
        let row = sqlx::query_as::<_, FeedRow>(&query)
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        row.map(Feed::try_from).transpose()
    }

    /// Get a feed by URL.
    pub async fn get_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = $1");
        let row = sqlx::query_as::<_, FeedRow>(&query)
            .bind(url)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        row.map(Feed::try_from).transpose()
    }

    /// List all feeds (ordered by registration order).
    pub async fn list_all(&self) -> Result<Vec<Feed>> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY id ASC");
        let rows = sqlx::query_as::<_, FeedRow>(&query)
            .fetch_all(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        rows.into_iter().map(Feed::try_from).collect()
    }

    /// List feeds that are not disabled and whose refresh interval has
    /// elapsed at `now`. Never-enqueued feeds come first.
    pub async fn list_eligible(&self, now: DateTime<Utc>) -> Result<Vec<Feed>> {
        let query = format!(
            r#"
            SELECT {FEED_COLUMNS}
            FROM feeds
            WHERE status != 'disabled'
            ORDER BY last_enqueued_at ASC NULLS FIRST, id ASC
            "#
        );
        let rows = sqlx::query_as::<_, FeedRow>(&query)
            .fetch_all(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        let mut feeds = Vec::with_capacity(rows.len());
        for row in rows {
            let feed = Feed::try_from(row)?;
            if feed.is_due(now) {
                feeds.push(feed);
            }
        }
        Ok(feeds)
    }

    /// Record that a fetch request for the feed was enqueued.
    pub async fn mark_enqueued(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let at = format_timestamp(at);
        let result = sqlx::query(
            "UPDATE feeds SET last_enqueued_at = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(&at)
        .bind(&at)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Set the status of a feed that is not disabled.
    ///
    /// A disabled feed is left untouched and `false` is returned, which
    /// makes repeated disables idempotent. The reason is stored only when
    /// disabling; other statuses clear it.
    pub async fn set_status(
        &self,
        id: i64,
        status: FeedStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let reason = match status {
            FeedStatus::Disabled => reason,
            FeedStatus::Ok | FeedStatus::Failing => None,
        };
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET status = $1, disabled_reason = $2, updated_at = $3
            WHERE id = $4 AND status != 'disabled'
            "#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(format_timestamp(now))
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a feed from one status to another only if it currently has
    /// the expected status.
    pub async fn transition_status(
        &self,
        id: i64,
        from: FeedStatus,
        to: FeedStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if from == FeedStatus::Disabled || to == FeedStatus::Disabled {
            return Err(FeedmonError::Validation(
                "disabled state is only entered through set_status and left through re_enable"
                    .to_string(),
            ));
        }
        let result = sqlx::query(
            "UPDATE feeds SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4",
        )
        .bind(to.as_str())
        .bind(format_timestamp(now))
        .bind(id)
        .bind(from.as_str())
        .execute(self.pool)
        .await
        .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Re-enable a disabled feed. This is the explicit external action
    /// that leaves the disabled state; the feed becomes due immediately.
    pub async fn re_enable(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET status = 'ok', disabled_reason = NULL, last_enqueued_at = NULL, updated_at = $1
            WHERE id = $2 AND status = 'disabled'
            "#,
        )
        .bind(format_timestamp(now))
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a feed.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = $1")
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Count feeds with the given status.
    pub async fn count_by_status(&self, status: FeedStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(count.0)
    }
}
