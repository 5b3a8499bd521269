//! Fetch request/response repository for feedmon.
//!
//! Uniqueness of `correlation_id` and `request_id` is enforced by the
//! schema; inserts use `ON CONFLICT DO NOTHING` so that a redelivered
//! message can never materialize a second row.

use chrono::{DateTime, Utc};

use super::types::{FetchOptions, FetchOutcome, FetchRequest, FetchResponse};
use crate::db::{format_timestamp, parse_timestamp, DbPool};
use crate::{FeedmonError, Result};

const RESPONSE_COLUMNS: &str = "r.id, r.request_id, r.status, r.http_status, r.content_hash, \
     r.latency_ms, r.error_message, r.created_at";

const REQUEST_COLUMNS: &str = "q.id, q.correlation_id, q.url, q.options, q.created_at";

/// Row type for fetch request from database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct FetchRequestRow {
    id: i64,
    correlation_id: String,
    url: String,
    options: String,
    created_at: String,
}

impl TryFrom<FetchRequestRow> for FetchRequest {
    type Error = FeedmonError;

    fn try_from(row: FetchRequestRow) -> Result<Self> {
        let options: FetchOptions = serde_json::from_str(&row.options)?;
        let created_at = parse_timestamp(&row.created_at).ok_or_else(|| {
            FeedmonError::Database(format!("bad request timestamp: {}", row.created_at))
        })?;
        Ok(FetchRequest {
            id: row.id,
            correlation_id: row.correlation_id,
            url: row.url,
            options,
            created_at,
        })
    }
}

/// Row type for fetch response from database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct FetchResponseRow {
    id: i64,
    request_id: i64,
    status: String,
    http_status: Option<i64>,
    content_hash: Option<String>,
    latency_ms: i64,
    error_message: Option<String>,
    created_at: String,
}

impl TryFrom<FetchResponseRow> for FetchResponse {
    type Error = FeedmonError;

    fn try_from(row: FetchResponseRow) -> Result<Self> {
        let created_at = parse_timestamp(&row.created_at).ok_or_else(|| {
            FeedmonError::Database(format!("bad response timestamp: {}", row.created_at))
        })?;
        Ok(FetchResponse {
            id: row.id,
            request_id: row.request_id,
            status: row.status.parse()?,
            http_status: row.http_status.map(|s| s as u16),
            content_hash: row.content_hash,
            latency_ms: row.latency_ms,
            error_message: row.error_message,
            created_at,
        })
    }
}

/// Position in a newest-first response history walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCursor {
    created_at: DateTime<Utc>,
    id: i64,
}

impl HistoryCursor {
    /// Cursor pointing just past the given response.
    pub fn after(response: &FetchResponse) -> Self {
        Self {
            created_at: response.created_at,
            id: response.id,
        }
    }
}

/// Repository for fetch request and response rows.
pub struct FetchRecordRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> FetchRecordRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Record a fetch request, or return the one already recorded for
    /// the same correlation id.
    ///
    /// The boolean is `true` when this call created the row.
    pub async fn insert_or_get_request(
        &self,
        correlation_id: &str,
        url: &str,
        options: &FetchOptions,
        now: DateTime<Utc>,
    ) -> Result<(FetchRequest, bool)> {
        let options = serde_json::to_string(options)?;

        let result = sqlx::query(
            r#"
            INSERT INTO fetch_requests (correlation_id, url, options, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(correlation_id) DO NOTHING
            "#,
        )
        .bind(correlation_id)
        .bind(url)
        .bind(&options)
        .bind(format_timestamp(now))
        .execute(self.pool)
        .await
        .map_err(|e| FeedmonError::Database(e.to_string()))?;

        let request = self
            .get_request_by_correlation_id(correlation_id)
            .await?
            .ok_or_else(|| FeedmonError::NotFound(format!("request {}", correlation_id)))?;

        Ok((request, result.rows_affected() > 0))
    }

    /// Get a request by row ID.
    pub async fn get_request(&self, id: i64) -> Result<Option<FetchRequest>> {
        let query = format!("SELECT {REQUEST_COLUMNS} FROM fetch_requests q WHERE q.id = $1");
        let row = sqlx::query_as::<_, FetchRequestRow>(&query)
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        row.map(FetchRequest::try_from).transpose()
    }

    /// Get a request by its correlation id.
    pub async fn get_request_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<FetchRequest>> {
        let query =
            format!("SELECT {REQUEST_COLUMNS} FROM fetch_requests q WHERE q.correlation_id = $1");
        let row = sqlx::query_as::<_, FetchRequestRow>(&query)
            .bind(correlation_id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        row.map(FetchRequest::try_from).transpose()
    }

    /// Get the request that owns a response.
    pub async fn get_request_by_response_id(&self, response_id: i64) -> Result<Option<FetchRequest>> {
        let query = format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM fetch_requests q
            JOIN fetch_responses r ON r.request_id = q.id
            WHERE r.id = $1
            "#
        );
        let row = sqlx::query_as::<_, FetchRequestRow>(&query)
            .bind(response_id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        row.map(FetchRequest::try_from).transpose()
    }

    /// Record the outcome of a request.
    ///
    /// A request has at most one response: if one exists already it is
    /// returned unchanged and the boolean is `false`.
    pub async fn insert_response(
        &self,
        request_id: i64,
        outcome: &FetchOutcome,
        now: DateTime<Utc>,
    ) -> Result<(FetchResponse, bool)> {
        let result = sqlx::query(
            r#"
            INSERT INTO fetch_responses (request_id, status, http_status, content_hash,
                                         latency_ms, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT(request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(outcome.status.as_str())
        .bind(outcome.http_status.map(i64::from))
        .bind(&outcome.content_hash)
        .bind(outcome.latency_ms as i64)
        .bind(&outcome.error_message)
        .bind(format_timestamp(now))
        .execute(self.pool)
        .await
        .map_err(|e| FeedmonError::Database(e.to_string()))?;

        let response = self
            .get_response_for_request(request_id)
            .await?
            .ok_or_else(|| FeedmonError::NotFound(format!("response for request {}", request_id)))?;

        Ok((response, result.rows_affected() > 0))
    }

    /// Get the response for a request row, if the request has completed.
    pub async fn get_response_for_request(&self, request_id: i64) -> Result<Option<FetchResponse>> {
        let query =
            format!("SELECT {RESPONSE_COLUMNS} FROM fetch_responses r WHERE r.request_id = $1");
        let row = sqlx::query_as::<_, FetchResponseRow>(&query)
            .bind(request_id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        row.map(FetchResponse::try_from).transpose()
    }

    /// Get the response for the request with the given correlation id.
    pub async fn get_response_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<FetchResponse>> {
        let query = format!(
            r#"
            SELECT {RESPONSE_COLUMNS}
            FROM fetch_responses r
            JOIN fetch_requests q ON q.id = r.request_id
            WHERE q.correlation_id = $1
            "#
        );
        let row = sqlx::query_as::<_, FetchResponseRow>(&query)
            .bind(correlation_id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        row.map(FetchResponse::try_from).transpose()
    }

    /// Get one page of the response history for a URL, newest first.
    ///
    /// Pass the cursor of the last response of the previous page to
    /// continue the walk.
    pub async fn response_history(
        &self,
        url: &str,
        before: Option<HistoryCursor>,
        limit: i64,
    ) -> Result<Vec<FetchResponse>> {
        let (before_at, before_id) = match before {
            Some(cursor) => (Some(format_timestamp(cursor.created_at)), cursor.id),
            None => (None, 0),
        };
        let query = format!(
            r#"
            SELECT {RESPONSE_COLUMNS}
            FROM fetch_responses r
            JOIN fetch_requests q ON q.id = r.request_id
            WHERE q.url = $1
              AND ($2 IS NULL OR r.created_at < $2 OR (r.created_at = $2 AND r.id < $3))
            ORDER BY r.created_at DESC, r.id DESC
            LIMIT $4
            "#
        );
        let rows = sqlx::query_as::<_, FetchResponseRow>(&query)
            .bind(url)
            .bind(before_at)
            .bind(before_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        rows.into_iter().map(FetchResponse::try_from).collect()
    }

    /// Count requests that have no response yet.
    pub async fn count_in_flight(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM fetch_requests q
            LEFT JOIN fetch_responses r ON r.request_id = q.id
            WHERE r.id IS NULL
            "#,
        )
        .fetch_one(self.pool)
        .await
        .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(count.0)
    }

    /// Count requests recorded for a URL.
    pub async fn count_requests_for_url(&self, url: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fetch_requests WHERE url = $1")
            .bind(url)
            .fetch_one(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(count.0)
    }

    /// Delete requests (and their responses) created before `cutoff`.
    ///
    /// Returns the number of requests deleted.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fetch_requests WHERE created_at < $1")
            .bind(format_timestamp(cutoff))
            .execute(self.pool)
            .await
            .map_err(|e| FeedmonError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
