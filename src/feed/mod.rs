//! Feed collaborator for feedmon.
//!
//! Feed configuration CRUD lives elsewhere; this module only exposes what
//! the pipeline needs: lookup by URL, eligibility listing and status writes.

pub mod repository;
pub mod types;

pub use repository::FeedRepository;
pub use types::{Feed, FeedStatus, NewFeed};
