//! Authentication middleware.
//!
//! Verifies a provider session token from the Authorization header and
//! resolves the caller against the local user mirror. Webhook endpoints
//! never pass through here; they authenticate by signature instead.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use certiva_shared::OrgRole;

use super::jwt::JwtManager;

/// Database row type for the local user mirror lookup
#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: Option<String>,
    platform_role: String,
}

/// Authenticated caller extracted from a verified session token
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Local mirror row id. None when webhook sync has not caught up
    /// with a freshly created provider user.
    pub user_id: Option<Uuid>,
    /// Provider user ID from the token's `sub` claim
    pub external_id: String,
    pub email: Option<String>,
    /// Active organization from the session, when one is selected
    pub org_id: Option<String>,
    pub org_role: Option<OrgRole>,
    /// Platform-level role from the local users table
    pub platform_role: String,
}

impl AuthUser {
    /// Get the active org external id, returning an error if the session
    /// has no organization selected
    pub fn require_org_id(&self) -> Result<&str, AuthError> {
        self.org_id.as_deref().ok_or(AuthError::NoOrganization)
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
}

/// Extract bearer token from Authorization header
fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(String::from)
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = if let Some(token) = extract_bearer_token(&request) {
        authenticate_session(&auth_state, &token).await
    } else {
        tracing::warn!(path = %path, "require_auth: no bearer token");
        Err(AuthError::MissingAuth)
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                external_id = %auth_user.external_id,
                org_id = ?auth_user.org_id,
                platform_role = %auth_user.platform_role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

async fn authenticate_session(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state.jwt_manager.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "Session token rejected");
        AuthError::InvalidToken
    })?;

    // The mirror may lag the provider. A missing row just means the
    // user.created webhook has not landed yet; the session is still valid.
    let user: Option<UserRow> =
        sqlx::query_as("SELECT id, email, platform_role FROM users WHERE external_id = $1")
            .bind(&claims.sub)
            .fetch_optional(&auth_state.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to load user during authentication");
                AuthError::DatabaseError
            })?;

    let org_role = claims.org_role.as_deref().and_then(OrgRole::parse);

    Ok(match user {
        Some(row) => AuthUser {
            user_id: Some(row.id),
            external_id: claims.sub,
            email: row.email,
            org_id: claims.org_id,
            org_role,
            platform_role: row.platform_role,
        },
        None => AuthUser {
            user_id: None,
            external_id: claims.sub,
            email: None,
            org_id: claims.org_id,
            org_role,
            platform_role: "user".to_string(),
        },
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("No organization found")]
    NoOrganization,
    #[error("Database error")]
    DatabaseError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
            AuthError::NoOrganization => (
                StatusCode::BAD_REQUEST,
                "No active organization in this session",
            ),
            AuthError::DatabaseError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_auth_header(value: &str) -> Request {
        Request::builder()
            .uri("/api/v1/admin/sync/records")
            .header(AUTHORIZATION, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_bearer_token_extracted() {
        let request = request_with_auth_header("Bearer abc.def.ghi");
        assert_eq!(
            extract_bearer_token(&request).as_deref(),
            Some("abc.def.ghi")
        );
    }

    #[test]
    fn test_non_bearer_scheme_ignored() {
        let request = request_with_auth_header("Basic dXNlcjpwYXNz");
        assert!(extract_bearer_token(&request).is_none());
    }

    #[test]
    fn test_missing_header_yields_none() {
        let request = Request::builder()
            .uri("/api/v1/admin/sync/records")
            .body(Body::empty())
            .unwrap();
        assert!(extract_bearer_token(&request).is_none());
    }

    #[test]
    fn test_auth_error_status_codes() {
        assert_eq!(
            AuthError::MissingAuth.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::InsufficientPermissions.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::NoOrganization.into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_require_org_id() {
        let with_org = AuthUser {
            user_id: None,
            external_id: "user_1".to_string(),
            email: None,
            org_id: Some("org_1".to_string()),
            org_role: Some(OrgRole::Admin),
            platform_role: "user".to_string(),
        };
        assert_eq!(with_org.require_org_id().unwrap(), "org_1");

        let without_org = AuthUser {
            org_id: None,
            ..with_org
        };
        assert!(matches!(
            without_org.require_org_id(),
            Err(AuthError::NoOrganization)
        ));
    }
}
