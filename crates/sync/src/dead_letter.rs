//! Dead letter queue for failed sync workflows.
//!
//! A dead letter item is the durable record of a sync failure awaiting
//! human attention. At most one open item exists per failing
//! (entity, webhook event) pair; repeated failures fold into it. Items
//! leave the queue one of two ways: a retry workflow succeeds and
//! auto-resolves them, or an operator resolves them by hand.
//!
//! State machine per item:
//!   open --retry--> open (retry_count + 1, new workflow)
//!   open --retry workflow succeeds--> resolved (by system)
//!   open --manual resolve--> resolved (terminal)
//! Resolved items never reopen; a later failure of the same pair opens a
//! fresh item.

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::events::EntityType;
use crate::records::SyncRecordStore;
use crate::workflows::{SyncJob, WorkflowRunner};

/// Marker stored in `resolved_by` when a retry resolves an item.
const RESOLVED_BY_RETRY: &str = "system:retry";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DeadLetterItem {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub webhook_event: String,
    pub workflow_id: Uuid,
    pub payload: Option<serde_json::Value>,
    pub error: String,
    pub retryable: bool,
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub first_failed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub resolved_by: Option<String>,
}

impl DeadLetterItem {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Response body for a single accepted retry.
#[derive(Debug, Clone, Serialize)]
pub struct RetryReceipt {
    pub dead_letter_id: Uuid,
    pub workflow_id: Uuid,
    pub retry_count: i32,
}

/// Aggregate outcome of a bulk retry pass. Counters partition the
/// candidate set: every item lands in exactly one bucket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkRetryReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

const ITEM_COLUMNS: &str =
    "id, entity_type, entity_id, webhook_event, workflow_id, payload, error, \
     retryable, retry_count, first_failed_at, resolved_at, resolved_by";

/// Row-level operations on `dead_letter_items`.
#[derive(Clone)]
pub struct DeadLetterStore {
    pool: PgPool,
}

impl DeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a workflow failure, folding into the open item for the
    /// same (entity, event) pair if one exists.
    ///
    /// The fold keeps the original `first_failed_at` and `retry_count`
    /// and repoints the item at the newest failing workflow. A stored
    /// payload is only replaced, never cleared.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_failure(
        &self,
        entity_type: &str,
        entity_id: &str,
        webhook_event: &str,
        workflow_id: Uuid,
        payload: Option<&serde_json::Value>,
        error: &str,
        retryable: bool,
    ) -> SyncResult<Uuid> {
        let item_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO dead_letter_items
                (entity_type, entity_id, webhook_event, workflow_id, payload, error, retryable)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (entity_type, entity_id, webhook_event) WHERE resolved_at IS NULL
            DO UPDATE SET
                workflow_id = EXCLUDED.workflow_id,
                payload = COALESCE(EXCLUDED.payload, dead_letter_items.payload),
                error = EXCLUDED.error,
                retryable = EXCLUDED.retryable,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(webhook_event)
        .bind(workflow_id)
        .bind(payload)
        .bind(error)
        .bind(retryable)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(
            dead_letter_id = %item_id,
            entity_type = %entity_type,
            entity_id = %entity_id,
            event = %webhook_event,
            workflow_id = %workflow_id,
            retryable,
            "Sync failure dead-lettered"
        );

        Ok(item_id)
    }

    pub async fn get(&self, id: Uuid) -> SyncResult<Option<DeadLetterItem>> {
        let item = sqlx::query_as::<_, DeadLetterItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM dead_letter_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    /// List items newest-first, open items only unless asked otherwise.
    pub async fn list(
        &self,
        include_resolved: bool,
        page: u32,
        limit: u32,
    ) -> SyncResult<(Vec<DeadLetterItem>, i64)> {
        let where_clause = if include_resolved {
            ""
        } else {
            " WHERE resolved_at IS NULL"
        };

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM dead_letter_items{where_clause}"))
                .fetch_one(&self.pool)
                .await?;

        let offset = (page.saturating_sub(1)) * limit;
        let items = sqlx::query_as::<_, DeadLetterItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM dead_letter_items{where_clause} \
             ORDER BY first_failed_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok((items, total))
    }

    /// All open retryable items, oldest failure first. Bulk retry order.
    pub async fn list_open_retryable(&self) -> SyncResult<Vec<DeadLetterItem>> {
        let items = sqlx::query_as::<_, DeadLetterItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM dead_letter_items \
             WHERE resolved_at IS NULL AND retryable = TRUE \
             ORDER BY first_failed_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Resolve an item because its retry workflow succeeded. The
    /// workflow id guard makes sure only the item's current retry can
    /// resolve it; a stale workflow completing late is a no-op.
    pub async fn resolve_after_retry(&self, id: Uuid, workflow_id: Uuid) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_items
            SET resolved_at = NOW(), resolved_by = $3, updated_at = NOW()
            WHERE id = $1 AND workflow_id = $2 AND resolved_at IS NULL
            "#,
        )
        .bind(id)
        .bind(workflow_id)
        .bind(RESOLVED_BY_RETRY)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Manually resolve an item. Terminal: resolved items reject both
    /// retry and a second resolve.
    pub async fn resolve(&self, id: Uuid, resolved_by: &str) -> SyncResult<DeadLetterItem> {
        let resolved = sqlx::query_as::<_, DeadLetterItem>(&format!(
            "UPDATE dead_letter_items \
             SET resolved_at = NOW(), resolved_by = $2, updated_at = NOW() \
             WHERE id = $1 AND resolved_at IS NULL \
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(id)
        .bind(resolved_by)
        .fetch_optional(&self.pool)
        .await?;

        match resolved {
            Some(item) => {
                tracing::info!(
                    dead_letter_id = %id,
                    resolved_by = %resolved_by,
                    "Dead letter item manually resolved"
                );
                Ok(item)
            }
            None => match self.get(id).await? {
                Some(_) => Err(SyncError::AlreadyResolved),
                None => Err(SyncError::DeadLetterNotFound),
            },
        }
    }

    /// Atomically claim an item for one retry attempt.
    ///
    /// Compare-and-swap on the current workflow id: of two concurrent
    /// retries only one advances the item, the other sees zero rows.
    /// Returns the new retry count.
    async fn claim_retry(
        &self,
        id: Uuid,
        expected_workflow: Uuid,
        new_workflow: Uuid,
    ) -> SyncResult<i32> {
        let retry_count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE dead_letter_items
            SET retry_count = retry_count + 1, workflow_id = $3, updated_at = NOW()
            WHERE id = $1 AND workflow_id = $2 AND resolved_at IS NULL
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(expected_workflow)
        .bind(new_workflow)
        .fetch_optional(&self.pool)
        .await?;

        match retry_count {
            Some(count) => Ok(count),
            None => match self.get(id).await? {
                Some(item) if item.is_resolved() => Err(SyncError::AlreadyResolved),
                Some(_) => Err(SyncError::RetryInFlight),
                None => Err(SyncError::DeadLetterNotFound),
            },
        }
    }
}

/// Retry and resolution orchestration on top of the store.
#[derive(Clone)]
pub struct DeadLetterService {
    store: DeadLetterStore,
    records: SyncRecordStore,
    runner: WorkflowRunner,
}

impl DeadLetterService {
    pub fn new(store: DeadLetterStore, records: SyncRecordStore, runner: WorkflowRunner) -> Self {
        Self {
            store,
            records,
            runner,
        }
    }

    pub fn store(&self) -> &DeadLetterStore {
        &self.store
    }

    pub async fn get(&self, id: Uuid) -> SyncResult<DeadLetterItem> {
        self.store.get(id).await?.ok_or(SyncError::DeadLetterNotFound)
    }

    pub async fn list(
        &self,
        include_resolved: bool,
        page: u32,
        limit: u32,
    ) -> SyncResult<(Vec<DeadLetterItem>, i64)> {
        self.store.list(include_resolved, page, limit).await
    }

    pub async fn resolve(&self, id: Uuid, resolved_by: &str) -> SyncResult<DeadLetterItem> {
        self.store.resolve(id, resolved_by).await
    }

    /// Retry a single item: claim it, spawn a fresh workflow replaying
    /// the stored payload, and return immediately. The item resolves
    /// itself if the workflow succeeds.
    pub async fn retry(&self, id: Uuid) -> SyncResult<RetryReceipt> {
        let item = self.get(id).await?;
        let (job, new_workflow) = self.prepare_retry(&item).await?;
        let retry_count = self
            .store
            .claim_retry(item.id, item.workflow_id, new_workflow)
            .await?;

        self.create_retry_record(&item, new_workflow).await?;

        tracing::info!(
            dead_letter_id = %item.id,
            workflow_id = %new_workflow,
            retry_count,
            "Dead letter retry dispatched"
        );

        self.runner.dispatch(new_workflow, job);

        Ok(RetryReceipt {
            dead_letter_id: item.id,
            workflow_id: new_workflow,
            retry_count,
        })
    }

    /// Retry every open retryable item sequentially, running each
    /// workflow inline so the report reflects real sync outcomes.
    ///
    /// Individual failures never abort the batch: items that fail again
    /// stay open and count as `failed`, items rejected by the claim
    /// guards count as `skipped`.
    pub async fn retry_all(&self) -> SyncResult<BulkRetryReport> {
        let items = self.store.list_open_retryable().await?;
        let mut report = BulkRetryReport {
            total: items.len(),
            ..Default::default()
        };

        for item in items {
            match self.retry_one_inline(&item).await {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.failed += 1,
                Err(
                    SyncError::AlreadyResolved
                    | SyncError::RetryInFlight
                    | SyncError::DeadLetterNotFound
                    | SyncError::NotRetryable
                    | SyncError::PayloadUnavailable,
                ) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        dead_letter_id = %item.id,
                        error = %e,
                        "Bulk retry could not dispatch item"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Bulk dead letter retry complete"
        );

        Ok(report)
    }

    async fn retry_one_inline(&self, item: &DeadLetterItem) -> SyncResult<bool> {
        let (job, new_workflow) = self.prepare_retry(item).await?;
        self.store
            .claim_retry(item.id, item.workflow_id, new_workflow)
            .await?;
        self.create_retry_record(item, new_workflow).await?;
        Ok(self.runner.run(new_workflow, job).await)
    }

    /// Validate an item for retry and build its replay job. Rejections
    /// here leave the item untouched.
    async fn prepare_retry(&self, item: &DeadLetterItem) -> SyncResult<(SyncJob, Uuid)> {
        if item.is_resolved() {
            return Err(SyncError::AlreadyResolved);
        }
        if !item.retryable {
            return Err(SyncError::NotRetryable);
        }
        let payload = item.payload.clone().ok_or(SyncError::PayloadUnavailable)?;
        let entity_type = EntityType::parse(&item.entity_type).ok_or_else(|| {
            SyncError::Internal(format!("unknown entity type stored: {}", item.entity_type))
        })?;

        // An unfinished workflow for this item means a retry (or the
        // original run) is still in flight.
        if self.records.has_pending_workflow(item.workflow_id).await? {
            return Err(SyncError::RetryInFlight);
        }

        let job = SyncJob {
            entity_type,
            entity_id: item.entity_id.clone(),
            webhook_event: item.webhook_event.clone(),
            payload,
            dead_letter_id: Some(item.id),
        };

        Ok((job, Uuid::new_v4()))
    }

    async fn create_retry_record(&self, item: &DeadLetterItem, workflow_id: Uuid) -> SyncResult<()> {
        let entity_type = EntityType::parse(&item.entity_type).ok_or_else(|| {
            SyncError::Internal(format!("unknown entity type stored: {}", item.entity_type))
        })?;
        self.records
            .create_pending(entity_type, &item.entity_id, &item.webhook_event, workflow_id, None)
            .await?;
        Ok(())
    }
}
