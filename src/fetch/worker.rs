//! Fetch worker: the handler for fetch-request messages.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::client::FetchClient;
use super::repository::FetchRecordRepository;
use super::types::{FetchRequestMessage, FetchResponse};
use crate::clock::Clock;
use crate::db::Database;
use crate::failure::{FailureDecision, FailureTracker};
use crate::queue::{MessageHandler, ReceivedMessage};
use crate::Result;

/// What the worker did with a message.
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    /// The request already had a response. No fetch ran; the URL was
    /// re-evaluated in case an earlier delivery stopped before the tracker.
    Duplicate { decision: FailureDecision },
    /// The fetch ran and its response was stored.
    Completed {
        response: FetchResponse,
        decision: FailureDecision,
    },
}

/// Performs fetches and records their outcome.
pub struct FetchWorker {
    db: Database,
    client: FetchClient,
    tracker: FailureTracker,
    clock: Arc<dyn Clock>,
}

impl FetchWorker {
    /// Create a new worker.
    pub fn new(
        db: Database,
        client: FetchClient,
        tracker: FailureTracker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            client,
            tracker,
            clock,
        }
    }

    /// Process one fetch request.
    ///
    /// Returns an error only for local failures (persistence), never for
    /// a failed fetch.
    pub async fn process(&self, message: &FetchRequestMessage) -> Result<WorkOutcome> {
        let repo = FetchRecordRepository::new(self.db.pool());

        let (request, created) = repo
            .insert_or_get_request(
                &message.request_id,
                &message.url,
                &message.options,
                self.clock.now(),
            )
            .await?;

        if !created {
            if repo.get_response_for_request(request.id).await?.is_some() {
                debug!(
                    url = %request.url,
                    request_id = %request.correlation_id,
                    "Duplicate delivery, already processed"
                );
                let decision = self.tracker.evaluate(&request.url).await?;
                return Ok(WorkOutcome::Duplicate { decision });
            }
            info!(
                url = %request.url,
                request_id = %request.correlation_id,
                "Resuming request without a response"
            );
        }

        // The stored request is authoritative for URL and options
        let outcome = self.client.fetch(&request.url, &request.options).await;

        let (response, inserted) = repo
            .insert_response(request.id, &outcome, self.clock.now())
            .await?;
        if !inserted {
            debug!(
                url = %request.url,
                request_id = %request.correlation_id,
                "Response recorded by a concurrent delivery"
            );
            let decision = self.tracker.evaluate(&request.url).await?;
            return Ok(WorkOutcome::Duplicate { decision });
        }

        if response.is_success() {
            debug!(
                url = %request.url,
                http_status = ?response.http_status,
                latency_ms = response.latency_ms,
                "Fetch succeeded"
            );
        } else {
            warn!(
                url = %request.url,
                status = %response.status,
                http_status = ?response.http_status,
                "Fetch failed: {}",
                response.error_message.as_deref().unwrap_or("no detail")
            );
        }

        let decision = self.tracker.evaluate(&request.url).await?;
        Ok(WorkOutcome::Completed { response, decision })
    }
}

#[async_trait]
impl MessageHandler for FetchWorker {
    async fn handle(&self, message: &ReceivedMessage) -> Result<()> {
        let request: FetchRequestMessage = serde_json::from_str(&message.body)?;
        self.process(&request).await?;
        Ok(())
    }
}
