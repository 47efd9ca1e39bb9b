//! Admin dashboard endpoints for the sync pipeline.
//!
//! Sync records, dead letter management, and invariant checks. All
//! handlers require platform admin privileges; staff get read access.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use certiva_sync::{
    BulkRetryReport, DeadLetterItem, EntityType, InvariantCheckSummary, RecordFilter,
    RetryReceipt, SyncRecord, SyncStats, SyncStatus,
};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListRecordsQuery {
    pub entity_type: Option<String>,
    pub status: Option<String>,
    pub entity_id: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SyncRecordListResponse {
    pub records: Vec<SyncRecord>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct ListDeadLettersQuery {
    pub include_resolved: Option<bool>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub items: Vec<DeadLetterItem>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, FromRow)]
struct PlatformRoleRow {
    platform_role: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Check if the authenticated user has platform admin privileges
async fn require_platform_admin(
    state: &AppState,
    auth_user: &AuthUser,
    require_write: bool,
) -> ApiResult<Uuid> {
    let user_id = auth_user.user_id.ok_or(ApiError::Unauthorized)?;

    let row: Option<PlatformRoleRow> =
        sqlx::query_as("SELECT platform_role FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&state.pool)
            .await?;

    let platform_role = row
        .map(|r| r.platform_role)
        .unwrap_or_else(|| "user".to_string());

    match platform_role.as_str() {
        "superadmin" | "admin" => Ok(user_id),
        "staff" if !require_write => Ok(user_id), // Staff can read but not write
        _ => {
            tracing::warn!(
                user_id = %user_id,
                platform_role = %platform_role,
                "Unauthorized admin access attempt"
            );
            Err(ApiError::Forbidden)
        }
    }
}

// =============================================================================
// Sync Record Endpoints
// =============================================================================

/// List sync records with optional filters
pub async fn list_sync_records(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListRecordsQuery>,
) -> ApiResult<Json<SyncRecordListResponse>> {
    require_platform_admin(&state, &auth_user, false).await?;

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(50).min(100);

    let entity_type = match query.entity_type.as_deref() {
        Some(raw) => Some(
            EntityType::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("Unknown entity type: {}", raw)))?,
        ),
        None => None,
    };
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            SyncStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("Unknown sync status: {}", raw)))?,
        ),
        None => None,
    };

    let filter = RecordFilter {
        entity_type,
        status,
        entity_id: query.entity_id,
    };

    let (records, total) = state.sync.records.list(&filter, page, limit).await?;

    Ok(Json(SyncRecordListResponse {
        records,
        total,
        page,
        limit,
    }))
}

/// Aggregate sync counters for the dashboard header
pub async fn sync_stats(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SyncStats>> {
    require_platform_admin(&state, &auth_user, false).await?;

    let stats = state.sync.records.stats().await?;
    Ok(Json(stats))
}

// =============================================================================
// Dead Letter Endpoints
// =============================================================================

/// List dead letter items, open items only by default
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListDeadLettersQuery>,
) -> ApiResult<Json<DeadLetterListResponse>> {
    require_platform_admin(&state, &auth_user, false).await?;

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(50).min(100);
    let include_resolved = query.include_resolved.unwrap_or(false);

    let (items, total) = state
        .sync
        .dead_letters
        .list(include_resolved, page, limit)
        .await?;

    Ok(Json(DeadLetterListResponse {
        items,
        total,
        page,
        limit,
    }))
}

/// Retry a single dead letter item
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RetryReceipt>> {
    let admin_user_id = require_platform_admin(&state, &auth_user, true).await?;

    let receipt = state.sync.dead_letters.retry(id).await?;

    tracing::info!(
        admin_user_id = %admin_user_id,
        dead_letter_id = %id,
        workflow_id = %receipt.workflow_id,
        "Dead letter retry dispatched by admin"
    );

    Ok(Json(receipt))
}

/// Manually resolve a dead letter item without retrying it
pub async fn resolve_dead_letter(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeadLetterItem>> {
    let admin_user_id = require_platform_admin(&state, &auth_user, true).await?;

    let item = state
        .sync
        .dead_letters
        .resolve(id, &auth_user.external_id)
        .await?;

    tracing::info!(
        admin_user_id = %admin_user_id,
        dead_letter_id = %id,
        "Dead letter manually resolved by admin"
    );

    Ok(Json(item))
}

/// Retry every open retryable dead letter item
pub async fn retry_all_dead_letters(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<BulkRetryReport>> {
    let admin_user_id = require_platform_admin(&state, &auth_user, true).await?;

    let report = state.sync.dead_letters.retry_all().await?;

    tracing::info!(
        admin_user_id = %admin_user_id,
        total = report.total,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "Bulk dead letter retry finished"
    );

    Ok(Json(report))
}

// =============================================================================
// Invariant Endpoints
// =============================================================================

/// Run all sync invariant checks
pub async fn run_invariant_checks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    require_platform_admin(&state, &auth_user, false).await?;

    let summary = state.sync.invariants.run_all_checks().await?;
    Ok(Json(summary))
}
