//! Stripe billing portal sessions

use sqlx::PgPool;
use stripe::{BillingPortalSession, CreateBillingPortalSession, CustomerId};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct PortalResponse {
    pub url: String,
}

/// Portal service for self-service subscription management
pub struct PortalService {
    stripe: StripeClient,
    pool: PgPool,
}

impl PortalService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a billing portal session. The org must already have a Stripe
    /// customer, which means it has been through checkout at least once.
    pub async fn create_portal_session(
        &self,
        org_external_id: &str,
    ) -> BillingResult<PortalResponse> {
        let customer_id: Option<Option<String>> = sqlx::query_scalar(
            "SELECT stripe_customer_id FROM organizations WHERE external_id = $1",
        )
        .bind(org_external_id)
        .fetch_optional(&self.pool)
        .await?;

        let customer_id = customer_id
            .ok_or_else(|| BillingError::OrganizationNotFound(org_external_id.to_string()))?
            .ok_or_else(|| BillingError::CustomerNotFound(org_external_id.to_string()))?;

        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let config = self.stripe.config();
        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(&config.portal_return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            org_external_id = %org_external_id,
            "Created billing portal session"
        );

        Ok(PortalResponse { url: session.url })
    }
}
