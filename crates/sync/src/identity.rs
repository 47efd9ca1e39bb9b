//! Identity provider management API client.
//!
//! Used only for account deletion: removing memberships and deleting the
//! user at the provider. Everything else flows the other way, from the
//! provider's webhooks into the mirror tables.

use reqwest::StatusCode;

use crate::error::{SyncError, SyncResult};

const DEFAULT_API_BASE: &str = "https://api.clerk.com/v1";

#[derive(Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl IdentityClient {
    pub fn new(secret_key: String, api_base: Option<String>) -> Self {
        let api_base = api_base
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            http: reqwest::Client::new(),
            api_base,
            secret_key,
        }
    }

    /// Build a client from `CLERK_SECRET_KEY` / `CLERK_API_BASE`.
    /// Returns `None` when no secret key is configured, which disables
    /// account deletion but nothing else.
    pub fn from_env() -> Option<Self> {
        let secret_key = std::env::var("CLERK_SECRET_KEY").ok()?;
        if secret_key.is_empty() {
            return None;
        }
        let api_base = std::env::var("CLERK_API_BASE").ok();
        Some(Self::new(secret_key, api_base))
    }

    /// Delete a user at the provider. A 404 means the user is already
    /// gone, which is the state we wanted.
    pub async fn delete_user(&self, user_external_id: &str) -> SyncResult<()> {
        let url = format!("{}/users/{}", self.api_base, user_external_id);
        self.delete(&url, "delete user").await
    }

    /// Remove a user's membership in an organization. 404 is success for
    /// the same reason as [`delete_user`](Self::delete_user).
    pub async fn delete_membership(
        &self,
        org_external_id: &str,
        user_external_id: &str,
    ) -> SyncResult<()> {
        let url = format!(
            "{}/organizations/{}/memberships/{}",
            self.api_base, org_external_id, user_external_id
        );
        self.delete(&url, "delete membership").await
    }

    async fn delete(&self, url: &str, action: &str) -> SyncResult<()> {
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| SyncError::Identity(format!("{action} request failed: {e}")))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            if status == StatusCode::NOT_FOUND {
                tracing::debug!(url = %url, "Provider resource already absent");
            }
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(SyncError::Identity(format!(
            "{action} returned {status}: {snippet}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> IdentityClient {
        IdentityClient::new("sk_test_123".to_string(), Some(server.url()))
    }

    #[tokio::test]
    async fn delete_user_hits_the_users_endpoint_with_bearer_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/users/user_abc")
            .match_header("authorization", "Bearer sk_test_123")
            .with_status(200)
            .with_body(r#"{"deleted": true}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        client.delete_user("user_abc").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn delete_membership_hits_the_nested_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/organizations/org_1/memberships/user_abc")
            .with_status(200)
            .create_async()
            .await;

        let client = client_for(&server);
        client.delete_membership("org_1", "user_abc").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_counts_as_already_deleted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/users/user_gone")
            .with_status(404)
            .with_body(r#"{"errors":[{"code":"resource_not_found"}]}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        assert!(client.delete_user("user_gone").await.is_ok());
    }

    #[tokio::test]
    async fn server_errors_surface_as_retryable_identity_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/users/user_abc")
            .with_status(500)
            .with_body("upstream exploded")
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.delete_user("user_abc").await.unwrap_err();
        assert!(matches!(err, SyncError::Identity(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn auth_failures_are_reported_with_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/users/user_abc")
            .with_status(401)
            .with_body(r#"{"errors":[{"code":"authentication_invalid"}]}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.delete_user("user_abc").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
