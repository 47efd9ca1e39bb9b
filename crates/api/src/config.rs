//! Server configuration

use anyhow::Context;

/// API server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind_address: String,
    /// Pooled database URL for request-path queries
    pub database_url: String,
    /// Direct database URL for migrations (bypasses PgBouncer)
    pub database_direct_url: Option<String>,
    /// Svix signing secret for the identity provider's webhooks
    pub identity_webhook_secret: String,
    /// PEM-encoded RS256 public key for verifying provider session JWTs
    pub identity_jwt_public_key: Option<String>,
    /// HS256 fallback secret for local development tokens
    pub jwt_secret: String,
    /// Whether to initialize Stripe billing (requires the billing feature)
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let identity_webhook_secret =
            std::env::var("CLERK_WEBHOOK_SECRET").context("CLERK_WEBHOOK_SECRET must be set")?;

        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url,
            database_direct_url: optional_env("DATABASE_DIRECT_URL"),
            identity_webhook_secret,
            identity_jwt_public_key: optional_env("CLERK_JWT_PUBLIC_KEY"),
            jwt_secret,
            enable_billing: std::env::var("ENABLE_BILLING")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_required_env() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/certiva_test");
        std::env::set_var("CLERK_WEBHOOK_SECRET", "whsec_dGVzdA==");
        std::env::set_var("JWT_SECRET", "dev-secret");
    }

    #[test]
    #[serial]
    fn test_from_env_with_defaults() {
        set_required_env();
        std::env::remove_var("BIND_ADDRESS");
        std::env::remove_var("ENABLE_BILLING");
        std::env::remove_var("CLERK_JWT_PUBLIC_KEY");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.enable_billing);
        assert!(config.identity_jwt_public_key.is_none());
    }

    #[test]
    #[serial]
    fn test_missing_database_url_fails() {
        set_required_env();
        std::env::remove_var("DATABASE_URL");

        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_billing_disabled_by_flag() {
        set_required_env();
        std::env::set_var("ENABLE_BILLING", "false");

        let config = Config::from_env().unwrap();
        assert!(!config.enable_billing);

        std::env::remove_var("ENABLE_BILLING");
    }
}
