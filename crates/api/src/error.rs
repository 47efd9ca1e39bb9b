//! API error handling

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use certiva_sync::{DeletionCheck, SyncError};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Account deletion blocked")]
    DeletionBlocked(DeletionCheck),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    Internal,
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!(error = %e, "Database error");
        ApiError::Database(e.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::SignatureInvalid => ApiError::Unauthorized,
            SyncError::Payload(msg) => ApiError::Validation(msg),
            SyncError::UnsupportedEvent(event) => {
                ApiError::Validation(format!("Unsupported event type: {}", event))
            }
            SyncError::DeadLetterNotFound => ApiError::NotFound,
            SyncError::AlreadyResolved => {
                ApiError::Conflict("Dead letter item is already resolved".into())
            }
            SyncError::NotRetryable => {
                ApiError::Conflict("Dead letter item is not retryable".into())
            }
            SyncError::RetryInFlight => {
                ApiError::Conflict("A retry for this item is already in flight".into())
            }
            SyncError::PayloadUnavailable => {
                ApiError::Conflict("Dead letter item has no stored payload to replay".into())
            }
            SyncError::DeletionBlocked(check) => ApiError::DeletionBlocked(check),
            SyncError::IdentityNotConfigured => {
                ApiError::ServiceUnavailable("Identity provider client is not configured".into())
            }
            SyncError::Database(e) => {
                tracing::error!(error = %e, "Database error during sync operation");
                ApiError::Database(e.to_string())
            }
            SyncError::Identity(msg) => {
                tracing::error!(error = %msg, "Identity provider request failed");
                ApiError::ServiceUnavailable(msg)
            }
            SyncError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal sync error");
                ApiError::Internal
            }
        }
    }
}

#[cfg(feature = "billing")]
impl From<certiva_billing::BillingError> for ApiError {
    fn from(e: certiva_billing::BillingError) -> Self {
        use certiva_billing::BillingError;
        match e {
            BillingError::InvalidTier(msg) => ApiError::Validation(msg),
            BillingError::OrganizationNotFound(_) | BillingError::CustomerNotFound(_) => {
                ApiError::NotFound
            }
            BillingError::WebhookSignatureInvalid => ApiError::Unauthorized,
            BillingError::WebhookEventNotSupported(event) => {
                ApiError::Validation(format!("Unsupported event type: {}", event))
            }
            BillingError::SubscriptionExists(_) => ApiError::Conflict(
                "Organization already has an active subscription; use the billing portal to change plans".into(),
            ),
            other => {
                tracing::error!(error = %other, "Billing error");
                ApiError::Database(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Deletion refusals carry the full eligibility report so the
        // client can show the user what to resolve.
        if let ApiError::DeletionBlocked(check) = &self {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "Account deletion blocked",
                    "code": StatusCode::CONFLICT.as_u16(),
                    "blockers": check.blockers,
                    "organizations": check.organizations,
                })),
            )
                .into_response();
        }

        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Conflict(_) | ApiError::DeletionBlocked(_) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            // Do not leak query details to clients.
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            ApiError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        (
            status,
            Json(json!({
                "error": message,
                "code": status.as_u16(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_failure_maps_to_unauthorized() {
        let err: ApiError = SyncError::SignatureInvalid.into();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[test]
    fn test_state_machine_rejections_map_to_conflict() {
        for sync_err in [
            SyncError::AlreadyResolved,
            SyncError::NotRetryable,
            SyncError::RetryInFlight,
            SyncError::PayloadUnavailable,
        ] {
            let err: ApiError = sync_err.into();
            assert!(matches!(err, ApiError::Conflict(_)));
        }
    }

    #[test]
    fn test_malformed_payload_maps_to_validation() {
        let err: ApiError = SyncError::Payload("missing id".into()).into();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_deletion_blocked_preserves_report() {
        let check = DeletionCheck {
            can_delete: false,
            blockers: vec!["org_1: transfer_ownership".into()],
            organizations: vec![],
        };
        let err: ApiError = SyncError::DeletionBlocked(check).into();
        match err {
            ApiError::DeletionBlocked(report) => {
                assert_eq!(report.blockers.len(), 1);
            }
            other => panic!("unexpected mapping: {:?}", other),
        }
    }
}
