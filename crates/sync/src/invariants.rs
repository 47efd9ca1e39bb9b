//! Sync invariants module.
//!
//! Runnable consistency checks over the sync pipeline and the mirror
//! tables. The worker runs them nightly; admins can trigger them from
//! the dashboard after an incident or a bulk replay.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SyncResult;

/// Pending workflows older than this are considered abandoned.
const STALE_PENDING_MINUTES: i64 = 30;

/// A retry count above this points at a stuck retry loop.
const RETRY_COUNT_CEILING: i32 = 500;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// External ids of the affected entities
    pub entity_ids: Vec<String>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - the sync state machine itself is inconsistent
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingRow {
    workflow_id: Uuid,
    entity_type: String,
    entity_id: String,
    webhook_event: String,
    received_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct UnaccountedFailureRow {
    workflow_id: Uuid,
    entity_type: String,
    entity_id: String,
    webhook_event: String,
    error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct OpenAfterSuccessRow {
    dead_letter_id: Uuid,
    workflow_id: Uuid,
    entity_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct RetryCountRow {
    dead_letter_id: Uuid,
    entity_id: String,
    retry_count: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanMembershipRow {
    org_external_id: String,
    user_external_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OwnerlessOrgRow {
    external_id: String,
    name: String,
}

/// Service for running sync invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> SyncResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_no_stale_pending().await?);
        violations.extend(self.check_failures_have_dead_letters().await?);
        violations.extend(self.check_no_open_item_after_success().await?);
        violations.extend(self.check_retry_count_sanity().await?);
        violations.extend(self.check_memberships_reference_orgs().await?);
        violations.extend(self.check_orgs_have_owner().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: No workflow stays pending forever
    ///
    /// The sweeper should be failing these; a stale pending record means
    /// the sweeper is not running or cannot write.
    async fn check_no_stale_pending(&self) -> SyncResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingRow> = sqlx::query_as(
            r#"
            SELECT workflow_id, entity_type, entity_id, webhook_event, received_at
            FROM sync_records
            WHERE status = 'pending'
              AND received_at < NOW() - ($1 * INTERVAL '1 minute')
            "#,
        )
        .bind(STALE_PENDING_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_pending_workflows".to_string(),
                entity_ids: vec![row.entity_id.clone()],
                description: format!(
                    "Workflow for {} '{}' ({}) has been pending since {}",
                    row.entity_type, row.entity_id, row.webhook_event, row.received_at
                ),
                context: serde_json::json!({
                    "workflow_id": row.workflow_id,
                    "webhook_event": row.webhook_event,
                    "received_at": row.received_at.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: Every failed workflow is dead-lettered
    ///
    /// A failed sync record with no dead letter item (open or resolved)
    /// for its (entity, event) pair is a failure nobody will ever see.
    /// Bounded to a week to keep the scan cheap.
    async fn check_failures_have_dead_letters(&self) -> SyncResult<Vec<InvariantViolation>> {
        let rows: Vec<UnaccountedFailureRow> = sqlx::query_as(
            r#"
            SELECT sr.workflow_id, sr.entity_type, sr.entity_id, sr.webhook_event, sr.error
            FROM sync_records sr
            WHERE sr.status = 'failed'
              AND sr.completed_at > NOW() - INTERVAL '7 days'
              AND NOT EXISTS (
                  SELECT 1 FROM dead_letter_items d
                  WHERE d.entity_type = sr.entity_type
                    AND d.entity_id = sr.entity_id
                    AND d.webhook_event = sr.webhook_event
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "failures_have_dead_letters".to_string(),
                entity_ids: vec![row.entity_id.clone()],
                description: format!(
                    "Failed workflow for {} '{}' ({}) has no dead letter item",
                    row.entity_type, row.entity_id, row.webhook_event
                ),
                context: serde_json::json!({
                    "workflow_id": row.workflow_id,
                    "webhook_event": row.webhook_event,
                    "error": row.error,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: An open item never outlives a successful workflow
    ///
    /// A successful retry auto-resolves its item; an open item whose
    /// current workflow succeeded means that hand-off broke.
    async fn check_no_open_item_after_success(&self) -> SyncResult<Vec<InvariantViolation>> {
        let rows: Vec<OpenAfterSuccessRow> = sqlx::query_as(
            r#"
            SELECT d.id as dead_letter_id, d.workflow_id, d.entity_id
            FROM dead_letter_items d
            JOIN sync_records sr ON sr.workflow_id = d.workflow_id
            WHERE d.resolved_at IS NULL
              AND sr.status = 'success'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_open_item_after_success".to_string(),
                entity_ids: vec![row.entity_id.clone()],
                description: "Dead letter item is still open although its workflow succeeded"
                    .to_string(),
                context: serde_json::json!({
                    "dead_letter_id": row.dead_letter_id,
                    "workflow_id": row.workflow_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Retry counts stay in a sane range
    async fn check_retry_count_sanity(&self) -> SyncResult<Vec<InvariantViolation>> {
        let rows: Vec<RetryCountRow> = sqlx::query_as(
            r#"
            SELECT id as dead_letter_id, entity_id, retry_count
            FROM dead_letter_items
            WHERE retry_count < 0 OR retry_count > $1
            "#,
        )
        .bind(RETRY_COUNT_CEILING)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "retry_count_sanity".to_string(),
                entity_ids: vec![row.entity_id.clone()],
                description: format!(
                    "Dead letter item has an implausible retry count of {}",
                    row.retry_count
                ),
                context: serde_json::json!({
                    "dead_letter_id": row.dead_letter_id,
                    "retry_count": row.retry_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: Memberships reference organizations we know
    ///
    /// Brief windows are expected while out-of-order webhooks land, so
    /// only memberships older than an hour count.
    async fn check_memberships_reference_orgs(&self) -> SyncResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanMembershipRow> = sqlx::query_as(
            r#"
            SELECT m.org_external_id, m.user_external_id
            FROM organization_memberships m
            LEFT JOIN organizations o ON o.external_id = m.org_external_id
            WHERE o.id IS NULL
              AND m.created_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "memberships_reference_orgs".to_string(),
                entity_ids: vec![row.org_external_id.clone()],
                description: format!(
                    "Membership of user '{}' references unknown organization '{}'",
                    row.user_external_id, row.org_external_id
                ),
                context: serde_json::json!({
                    "user_external_id": row.user_external_id,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Invariant 6: Every settled organization has an owner
    async fn check_orgs_have_owner(&self) -> SyncResult<Vec<InvariantViolation>> {
        let rows: Vec<OwnerlessOrgRow> = sqlx::query_as(
            r#"
            SELECT o.external_id, o.name
            FROM organizations o
            WHERE o.created_at < NOW() - INTERVAL '1 hour'
              AND NOT EXISTS (
                  SELECT 1 FROM organization_memberships m
                  WHERE m.org_external_id = o.external_id
                    AND m.role = 'owner'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "orgs_have_owner".to_string(),
                entity_ids: vec![row.external_id.clone()],
                description: format!("Organization '{}' has no owner membership", row.name),
                context: serde_json::json!({
                    "org_name": row.name,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
