//! Database schema and migrations for feedmon.
//!
//! Migrations are applied sequentially when the database is first opened
//! or upgraded.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
/// The schema_version table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: Feeds and fetch history
    r#"
-- Feeds scheduled for fetching
CREATE TABLE feeds (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    url                     TEXT NOT NULL UNIQUE,
    title                   TEXT NOT NULL,
    refresh_rate_seconds    INTEGER NOT NULL,
    status                  TEXT NOT NULL DEFAULT 'ok',  -- 'ok', 'failing', 'disabled'
    disabled_reason         TEXT,
    fetch_headers           TEXT,                        -- JSON object, forwarded verbatim
    request_timeout_secs    INTEGER,
    last_enqueued_at        TEXT,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL
);

CREATE INDEX idx_feeds_status ON feeds(status);

-- One row per fetch attempt
CREATE TABLE fetch_requests (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id  TEXT NOT NULL UNIQUE,
    url             TEXT NOT NULL,
    options         TEXT NOT NULL,                      -- JSON FetchOptions
    created_at      TEXT NOT NULL
);

CREATE INDEX idx_fetch_requests_url ON fetch_requests(url, created_at);

-- Outcome of a fetch attempt (at most one per request)
CREATE TABLE fetch_responses (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id      INTEGER NOT NULL UNIQUE REFERENCES fetch_requests(id) ON DELETE CASCADE,
    status          TEXT NOT NULL,
    http_status     INTEGER,
    content_hash    TEXT,
    latency_ms      INTEGER NOT NULL,
    error_message   TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX idx_fetch_responses_created_at ON fetch_responses(created_at);
"#,
    // v2: Durable message queue
    r#"
-- Messages for all queues; visibility is controlled by visible_at
CREATE TABLE queue_messages (
    id                  TEXT PRIMARY KEY,
    queue               TEXT NOT NULL,
    body                TEXT NOT NULL,
    sent_at             TEXT NOT NULL,
    visible_at          TEXT NOT NULL,
    receive_count       INTEGER NOT NULL DEFAULT 0,
    receipt_handle      TEXT UNIQUE,
    first_received_at   TEXT,
    dead_at             TEXT
);

CREATE INDEX idx_queue_messages_ready ON queue_messages(queue, dead_at, visible_at);
"#,
];
