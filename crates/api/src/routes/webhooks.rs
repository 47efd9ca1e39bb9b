//! Webhook intake endpoints.
//!
//! Raw-body handlers: signature verification needs the exact bytes the
//! provider signed, so these take `String` bodies and never go through
//! JSON extractors.

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::json;

use certiva_sync::{WebhookHeaders, WebhookReceipt};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

/// POST /webhooks/identity
///
/// Identity provider event intake. Missing signature headers are an
/// authentication failure, same as a bad signature.
pub async fn receive_identity_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let webhook_headers = WebhookHeaders {
        message_id: header_string(&headers, "svix-id").ok_or(ApiError::Unauthorized)?,
        timestamp: header_string(&headers, "svix-timestamp").ok_or(ApiError::Unauthorized)?,
        signature: header_string(&headers, "svix-signature").ok_or(ApiError::Unauthorized)?,
    };

    let receipt = state.sync.webhooks.receive(&webhook_headers, &body).await?;

    Ok(Json(match receipt {
        WebhookReceipt::Dispatched { workflow_id } => json!({
            "status": "dispatched",
            "workflow_id": workflow_id,
        }),
        WebhookReceipt::Duplicate => json!({
            "status": "duplicate",
        }),
        WebhookReceipt::Ignored { event_type } => json!({
            "status": "ignored",
            "event_type": event_type,
        }),
    }))
}

/// POST /webhooks/stripe
#[cfg(feature = "billing")]
pub async fn receive_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = state
        .billing_service()
        .ok_or_else(|| ApiError::ServiceUnavailable("Billing is not configured".into()))?;

    let signature = header_string(&headers, "Stripe-Signature").ok_or(ApiError::Unauthorized)?;

    let event = billing.webhooks.verify_event(&body, &signature)?;
    billing.webhooks.handle_event(event).await?;

    Ok(Json(json!({ "received": true })))
}
