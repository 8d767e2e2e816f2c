//! State shared between poll jobs and event consumers.
//!
//! # Broadcast Channel Behavior
//!
//! Every job run publishes a [`QueryEvent`] on `events_tx`. The channel never
//! blocks the poller: when a subscriber falls behind by more than
//! `server.broadcast_buffer` events it loses the oldest ones and receives a
//! `Lagged` error on its next `recv`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};

use unraid_core::ClassifiedError;

/// Shared poller state.
pub struct PollerState {
    /// Broadcast channel for query results.
    pub events_tx: broadcast::Sender<QueryEvent>,
    /// Latest successful payload per job.
    latest: RwLock<HashMap<String, LatestData>>,
}

impl PollerState {
    /// Create new poller state with the given event buffer size.
    pub fn new(buffer_size: usize) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(buffer_size.max(1));
        Arc::new(Self {
            events_tx,
            latest: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribe to query events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.events_tx.subscribe()
    }

    /// Store a successful payload and publish it.
    pub async fn record_success(&self, job_id: &str, data: Value) {
        let at = OffsetDateTime::now_utc();
        self.latest.write().await.insert(
            job_id.to_string(),
            LatestData {
                data: data.clone(),
                at,
            },
        );
        // No subscribers is fine.
        let _ = self.events_tx.send(QueryEvent {
            job_id: job_id.to_string(),
            at,
            outcome: QueryOutcome::Data { data },
        });
    }

    /// Publish a failure. The last good payload is kept.
    pub async fn record_failure(&self, job_id: &str, error: ClassifiedError) {
        let _ = self.events_tx.send(QueryEvent {
            job_id: job_id.to_string(),
            at: OffsetDateTime::now_utc(),
            outcome: QueryOutcome::Error { error },
        });
    }

    /// Latest successful payload for a job.
    pub async fn latest(&self, job_id: &str) -> Option<LatestData> {
        self.latest.read().await.get(job_id).cloned()
    }

    /// Drop the stored payload for a job.
    pub async fn forget(&self, job_id: &str) {
        self.latest.write().await.remove(job_id);
    }
}

/// A stored payload and when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestData {
    /// The `data` object returned by the server.
    pub data: Value,
    /// When it was received.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Result of one job run.
#[derive(Debug, Clone, Serialize)]
pub struct QueryEvent {
    /// Job id.
    pub job_id: String,
    /// When the run finished.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// What happened.
    #[serde(flatten)]
    pub outcome: QueryOutcome,
}

/// Payload or error of a job run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    /// The query returned data.
    Data { data: Value },
    /// The query failed.
    Error { error: ClassifiedError },
}

impl QueryOutcome {
    /// Whether the run succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Data { .. })
    }
}
