//! Self-service account endpoints.
//!
//! The caller acts on their own account only; identity comes from the
//! verified session, never from the request body.

use axum::{extract::State, Extension, Json};

use certiva_sync::{DeletionCheck, DeletionResult};

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

/// Report whether the caller can delete their account, and what stands
/// in the way if not
pub async fn deletion_check(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<DeletionCheck>> {
    let check = state.sync.deletion.check(&auth_user.external_id).await?;
    Ok(Json(check))
}

/// Delete the caller's account. Blocked deletions come back as 409 with
/// the blocker list.
pub async fn delete_account(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<DeletionResult>> {
    let result = state.sync.deletion.execute(&auth_user.external_id).await?;

    tracing::info!(
        external_id = %auth_user.external_id,
        memberships_removed = result.memberships_removed,
        provider_deleted = result.provider_deleted,
        "Account deletion executed"
    );

    Ok(Json(result))
}
