//! Sync record bookkeeping.
//!
//! Every webhook-triggered workflow gets exactly one row in
//! `sync_records`, created as `pending` before the workflow is spawned
//! and driven to `success` or `failed` exactly once. Rows are never
//! deleted; the admin dashboard reads them as the sync audit trail.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dead_letter::DeadLetterStore;
use crate::error::SyncResult;
use crate::events::EntityType;

/// Terminal and non-terminal states of a sync workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SyncStatus::Pending),
            "success" => Some(SyncStatus::Success),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SyncRecord {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub webhook_event: String,
    pub message_id: Option<String>,
    pub status: String,
    pub workflow_id: Uuid,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Filters for the admin sync record listing.
#[derive(Debug, Default, Clone)]
pub struct RecordFilter {
    pub entity_type: Option<EntityType>,
    pub status: Option<SyncStatus>,
    pub entity_id: Option<String>,
}

/// Aggregate counters for the dashboard header.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub total: i64,
    pub pending: i64,
    pub success: i64,
    pub failed: i64,
    pub failed_last_24h: i64,
    pub unresolved_dead_letters: i64,
}

/// Outcome of a stale-workflow sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub swept: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, FromRow)]
struct SweptRow {
    entity_type: String,
    entity_id: String,
    webhook_event: String,
    workflow_id: Uuid,
    message_id: Option<String>,
}

#[derive(Clone)]
pub struct SyncRecordStore {
    pool: PgPool,
}

impl SyncRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the pending record for a workflow about to be spawned.
    pub async fn create_pending(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        webhook_event: &str,
        workflow_id: Uuid,
        message_id: Option<&str>,
    ) -> SyncResult<Uuid> {
        let record_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO sync_records (entity_type, entity_id, webhook_event, workflow_id, message_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(webhook_event)
        .bind(workflow_id)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            workflow_id = %workflow_id,
            entity_type = %entity_type,
            entity_id = %entity_id,
            event = %webhook_event,
            "Sync record created"
        );

        Ok(record_id)
    }

    /// Mark a workflow's record successful. Only pending records
    /// transition; a completed record is left untouched.
    pub async fn mark_success(&self, workflow_id: Uuid, duration_ms: i64) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_records
            SET status = 'success', duration_ms = $2, completed_at = NOW(), updated_at = NOW()
            WHERE workflow_id = $1 AND status = 'pending'
            "#,
        )
        .bind(workflow_id)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                workflow_id = %workflow_id,
                "Success reported for a workflow whose record is no longer pending"
            );
        }
        Ok(())
    }

    /// Mark a workflow's record failed, recording the terminal error.
    pub async fn mark_failed(
        &self,
        workflow_id: Uuid,
        error: &str,
        duration_ms: i64,
    ) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_records
            SET status = 'failed', error = $2, duration_ms = $3, completed_at = NOW(), updated_at = NOW()
            WHERE workflow_id = $1 AND status = 'pending'
            "#,
        )
        .bind(workflow_id)
        .bind(error)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                workflow_id = %workflow_id,
                "Failure reported for a workflow whose record is no longer pending"
            );
        }
        Ok(())
    }

    /// Whether the given workflow still has an unfinished record.
    pub async fn has_pending_workflow(&self, workflow_id: Uuid) -> SyncResult<bool> {
        let pending: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM sync_records WHERE workflow_id = $1 AND status = 'pending'",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(pending.is_some())
    }

    pub async fn get_by_workflow(&self, workflow_id: Uuid) -> SyncResult<Option<SyncRecord>> {
        let record = sqlx::query_as::<_, SyncRecord>(
            r#"
            SELECT id, entity_type, entity_id, webhook_event, message_id, status,
                   workflow_id, error, duration_ms, received_at, completed_at
            FROM sync_records
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// List records newest-first with optional filters. Returns the page
    /// plus the total row count for the filter.
    pub async fn list(
        &self,
        filter: &RecordFilter,
        page: u32,
        limit: u32,
    ) -> SyncResult<(Vec<SyncRecord>, i64)> {
        let mut where_clause = String::from(" WHERE 1=1");
        let mut bind_count = 0;

        if filter.entity_type.is_some() {
            bind_count += 1;
            where_clause.push_str(&format!(" AND entity_type = ${bind_count}"));
        }
        if filter.status.is_some() {
            bind_count += 1;
            where_clause.push_str(&format!(" AND status = ${bind_count}"));
        }
        if filter.entity_id.is_some() {
            bind_count += 1;
            where_clause.push_str(&format!(" AND entity_id = ${bind_count}"));
        }

        let count_sql = format!("SELECT COUNT(*) FROM sync_records{where_clause}");
        let list_sql = format!(
            "SELECT id, entity_type, entity_id, webhook_event, message_id, status, \
             workflow_id, error, duration_ms, received_at, completed_at \
             FROM sync_records{where_clause} \
             ORDER BY received_at DESC \
             LIMIT ${} OFFSET ${}",
            bind_count + 1,
            bind_count + 2
        );

        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        let mut list_query = sqlx::query_as::<_, SyncRecord>(&list_sql);

        if let Some(entity_type) = filter.entity_type {
            count_query = count_query.bind(entity_type.as_str());
            list_query = list_query.bind(entity_type.as_str());
        }
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
            list_query = list_query.bind(status.as_str());
        }
        if let Some(entity_id) = &filter.entity_id {
            count_query = count_query.bind(entity_id.as_str());
            list_query = list_query.bind(entity_id.as_str());
        }

        let total = count_query.fetch_one(&self.pool).await?;
        let offset = (page.saturating_sub(1)) * limit;
        let records = list_query
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok((records, total))
    }

    pub async fn stats(&self) -> SyncResult<SyncStats> {
        let (total, pending, success, failed, failed_last_24h): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'pending'),
                    COUNT(*) FILTER (WHERE status = 'success'),
                    COUNT(*) FILTER (WHERE status = 'failed'),
                    COUNT(*) FILTER (WHERE status = 'failed'
                                     AND completed_at > NOW() - INTERVAL '24 hours')
                FROM sync_records
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        let unresolved_dead_letters: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dead_letter_items WHERE resolved_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SyncStats {
            total,
            pending,
            success,
            failed,
            failed_last_24h,
            unresolved_dead_letters,
        })
    }

    /// Fail every record stuck in `pending` longer than the timeout and
    /// dead-letter it as retryable.
    ///
    /// Catches workflows whose task died without reporting completion
    /// (process restart mid-sync). Payloads for replay come from the
    /// stored webhook event when the record still links to one.
    pub async fn sweep_stale(&self, older_than_minutes: i64) -> SyncResult<SweepReport> {
        let swept: Vec<SweptRow> = sqlx::query_as(
            r#"
            UPDATE sync_records
            SET status = 'failed',
                error = 'workflow timed out without reporting completion',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE status = 'pending'
              AND received_at < NOW() - ($1 * INTERVAL '1 minute')
            RETURNING entity_type, entity_id, webhook_event, workflow_id, message_id
            "#,
        )
        .bind(older_than_minutes)
        .fetch_all(&self.pool)
        .await?;

        let dead_letters = DeadLetterStore::new(self.pool.clone());
        let mut dead_lettered = 0;

        for row in &swept {
            let payload = match &row.message_id {
                Some(message_id) => {
                    sqlx::query_scalar::<_, Option<serde_json::Value>>(
                        "SELECT payload FROM identity_webhook_events WHERE svix_message_id = $1",
                    )
                    .bind(message_id)
                    .fetch_optional(&self.pool)
                    .await?
                    .flatten()
                }
                None => None,
            };

            match dead_letters
                .record_failure(
                    &row.entity_type,
                    &row.entity_id,
                    &row.webhook_event,
                    row.workflow_id,
                    payload.as_ref(),
                    "workflow timed out without reporting completion",
                    true,
                )
                .await
            {
                Ok(_) => dead_lettered += 1,
                Err(e) => {
                    tracing::error!(
                        workflow_id = %row.workflow_id,
                        error = %e,
                        "Failed to dead-letter a swept sync record"
                    );
                }
            }
        }

        if !swept.is_empty() {
            tracing::warn!(
                swept = swept.len(),
                dead_lettered,
                "Swept stale pending sync workflows"
            );
        }

        Ok(SweepReport {
            swept: swept.len(),
            dead_lettered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== STATUS PARSING ====================

    #[test]
    fn status_round_trips_through_as_str() {
        for status in [SyncStatus::Pending, SyncStatus::Success, SyncStatus::Failed] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert_eq!(SyncStatus::parse("running"), None);
        assert_eq!(SyncStatus::parse(""), None);
    }

    #[test]
    fn record_serializes_timestamps_as_rfc3339() {
        let record = SyncRecord {
            id: Uuid::nil(),
            entity_type: "user".into(),
            entity_id: "user_1".into(),
            webhook_event: "user.created".into(),
            message_id: None,
            status: "success".into(),
            workflow_id: Uuid::nil(),
            error: None,
            duration_ms: Some(42),
            received_at: OffsetDateTime::UNIX_EPOCH,
            completed_at: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["received_at"], "1970-01-01T00:00:00Z");
        assert_eq!(json["completed_at"], serde_json::Value::Null);
    }
}
