//! Feed fetching for feedmon.
//!
//! This module provides:
//! - An HTTP client that classifies every fetch outcome
//! - Storage for fetch requests and responses
//! - The worker that handles fetch-request messages

pub mod client;
pub mod repository;
pub mod types;
pub mod worker;

pub use client::{is_feed_content_type, validate_url, FetchClient};
pub use repository::{FetchRecordRepository, HistoryCursor};
pub use types::{
    FetchOptions, FetchOutcome, FetchRequest, FetchRequestMessage, FetchResponse, FetchStatus,
};
pub use worker::{FetchWorker, WorkOutcome};
