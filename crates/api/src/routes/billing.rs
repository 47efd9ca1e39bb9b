//! Billing endpoints.
//!
//! Checkout and portal sessions for the caller's active organization.
//! Only owners and admins of the org may manage billing.

use axum::{extract::State, Extension, Json};
use serde::Deserialize;

use certiva_billing::{BillingInterval, CheckoutResponse, PortalResponse};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub tier: String,
    /// "monthly" (default) or "annual"
    pub interval: Option<String>,
}

fn billing_org_id(auth_user: &AuthUser) -> ApiResult<&str> {
    let org_id = auth_user
        .org_id
        .as_deref()
        .ok_or_else(|| ApiError::Validation("No active organization in this session".into()))?;

    let can_manage = auth_user
        .org_role
        .map(|role| role.can_manage_billing())
        .unwrap_or(false);
    if !can_manage {
        tracing::warn!(
            external_id = %auth_user.external_id,
            org_id = %org_id,
            org_role = ?auth_user.org_role,
            "Billing access denied for non-admin member"
        );
        return Err(ApiError::Forbidden);
    }

    Ok(org_id)
}

/// Start a hosted checkout session for a paid tier
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = state
        .billing_service()
        .ok_or_else(|| ApiError::ServiceUnavailable("Billing is not configured".into()))?;
    let org_id = billing_org_id(&auth_user)?;

    let interval = match request.interval.as_deref() {
        Some(raw) => BillingInterval::parse(raw)
            .ok_or_else(|| ApiError::Validation(format!("Unknown billing interval: {}", raw)))?,
        None => BillingInterval::Monthly,
    };

    let response = billing
        .checkout
        .create_checkout_session(org_id, &request.tier, interval)
        .await?;

    tracing::info!(
        external_id = %auth_user.external_id,
        org_id = %org_id,
        tier = %request.tier,
        interval = %interval.as_str(),
        "Checkout session created"
    );

    Ok(Json(response))
}

/// Open a billing portal session for managing the existing subscription
pub async fn create_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PortalResponse>> {
    let billing = state
        .billing_service()
        .ok_or_else(|| ApiError::ServiceUnavailable("Billing is not configured".into()))?;
    let org_id = billing_org_id(&auth_user)?;

    let response = billing.portal.create_portal_session(org_id).await?;

    Ok(Json(response))
}
