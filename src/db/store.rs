use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::generation::GenerationRequest;

/// Outcome of the final commit of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Record completed and the owner was charged.
    Debited { remaining: i32 },
    /// Record completed but the balance no longer covered the cost; nothing charged.
    Underfunded,
    /// This job was settled by an earlier delivery; nothing changed.
    AlreadySettled,
    /// The record had already reached a terminal state; nothing changed.
    RecordClosed,
}

/// Persistence used by the worker pipeline for terminal transitions.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Mark the record completed and debit the owner, at most once per job.
    async fn settle_completed(
        &self,
        job: &GenerationRequest,
        prompt: &str,
        image_url: &str,
    ) -> Result<Settlement, sqlx::Error>;

    /// Mark the record failed. Returns `false` if it was already terminal.
    async fn mark_failed(&self, record_id: Uuid, error: &str) -> Result<bool, sqlx::Error>;

    /// The settlement an earlier delivery reached, or `None` while the record
    /// is still open.
    async fn prior_settlement(&self, record_id: Uuid) -> Result<Option<Settlement>, sqlx::Error>;
}

/// [`RecordStore`] over the Postgres pool.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn settle_completed(
        &self,
        job: &GenerationRequest,
        prompt: &str,
        image_url: &str,
    ) -> Result<Settlement, sqlx::Error> {
        queries::complete_and_settle(&self.pool, job, prompt, image_url).await
    }

    async fn mark_failed(&self, record_id: Uuid, error: &str) -> Result<bool, sqlx::Error> {
        queries::mark_thumbnail_failed(&self.pool, record_id, error).await
    }

    async fn prior_settlement(&self, record_id: Uuid) -> Result<Option<Settlement>, sqlx::Error> {
        queries::prior_settlement(&self.pool, record_id).await
    }
}
