//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

use certiva_sync::{IdentityClient, SyncService};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Sync pipeline: webhook intake, records, dead letters, deletion
    pub sync: Arc<SyncService>,
    /// Billing service (only available when billing feature is enabled)
    #[cfg(feature = "billing")]
    pub billing: Option<Arc<certiva_billing::BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        // Verify provider sessions with the published RS256 key when we
        // have one; otherwise fall back to the HS256 dev secret.
        let jwt_manager = match &config.identity_jwt_public_key {
            Some(pem) => match JwtManager::from_rsa_pem(pem) {
                Ok(manager) => {
                    tracing::info!("Provider session verification enabled (RS256)");
                    manager
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid CLERK_JWT_PUBLIC_KEY - falling back to shared-secret mode"
                    );
                    JwtManager::with_shared_secret(&config.jwt_secret)
                }
            },
            None => {
                tracing::warn!(
                    "CLERK_JWT_PUBLIC_KEY not configured - using HS256 shared-secret mode (development only)"
                );
                JwtManager::with_shared_secret(&config.jwt_secret)
            }
        };

        let identity = IdentityClient::from_env();
        if identity.is_some() {
            tracing::info!("Identity provider API client initialized");
        } else {
            tracing::warn!(
                "Identity provider API client not configured (missing CLERK_SECRET_KEY) - provider-side deletion disabled"
            );
        }

        let sync = Arc::new(SyncService::new(
            pool.clone(),
            &config.identity_webhook_secret,
            identity,
        ));

        // Try to initialize billing if Stripe env vars are set (only when feature is enabled)
        #[cfg(feature = "billing")]
        let billing = if config.enable_billing {
            match certiva_billing::BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        #[cfg(not(feature = "billing"))]
        tracing::info!("Billing feature not compiled in (build without --features billing)");

        Self {
            pool,
            config,
            jwt_manager,
            sync,
            #[cfg(feature = "billing")]
            billing,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
        }
    }

    /// Get billing service reference (returns None when billing feature is disabled)
    #[cfg(feature = "billing")]
    pub fn billing_service(&self) -> Option<&Arc<certiva_billing::BillingService>> {
        self.billing.as_ref()
    }
}
