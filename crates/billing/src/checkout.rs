//! Hosted checkout session creation
//!
//! Upgrades go through Stripe Checkout. The Stripe customer is created
//! lazily on the organization's first checkout and stored on the
//! organizations row so webhooks can map events back to the org.

use certiva_shared::SubscriptionTier;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CreateCustomer, Customer, CustomerId,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;

/// Billing interval for paid tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Annual,
}

impl BillingInterval {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "monthly" => Some(Self::Monthly),
            "annual" | "yearly" => Some(Self::Annual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

/// Checkout service for starting paid subscriptions
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a hosted checkout session for an organization upgrading to a
    /// paid tier. Rejects orgs that already hold an active subscription;
    /// plan changes go through the billing portal instead.
    pub async fn create_checkout_session(
        &self,
        org_external_id: &str,
        tier: &str,
        interval: BillingInterval,
    ) -> BillingResult<CheckoutResponse> {
        let parsed = SubscriptionTier::parse(tier)
            .ok_or_else(|| BillingError::InvalidTier(tier.to_string()))?;
        if !parsed.is_paid() {
            return Err(BillingError::InvalidTier(format!(
                "{} is not a self-service paid tier",
                tier
            )));
        }

        let price_id = match interval {
            BillingInterval::Monthly => self.stripe.config().price_id_for_tier(tier),
            BillingInterval::Annual => self.stripe.config().annual_price_id_for_tier(tier),
        }
        .ok_or_else(|| {
            BillingError::InvalidTier(format!("{} ({})", tier, interval.as_str()))
        })?
        .to_string();

        let subscriptions = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        if subscriptions.has_active_subscription(org_external_id).await? {
            return Err(BillingError::SubscriptionExists(org_external_id.to_string()));
        }

        let customer_id = self.ensure_customer(org_external_id).await?;
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_external_id".to_string(), org_external_id.to_string());
        metadata.insert("tier".to_string(), tier.to_string());
        metadata.insert("interval".to_string(), interval.as_str().to_string());

        let config = self.stripe.config();
        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.customer = Some(customer_id);
        params.client_reference_id = Some(org_external_id);
        params.success_url = Some(&config.checkout_success_url);
        params.cancel_url = Some(&config.checkout_cancel_url);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());
        // Metadata on the subscription itself, so subscription webhooks can
        // map back to the org without a customer lookup.
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            ..Default::default()
        });

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::StripeApi("Checkout session has no URL".to_string()))?;

        tracing::info!(
            org_external_id = %org_external_id,
            tier = %tier,
            interval = %interval.as_str(),
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(CheckoutResponse { url })
    }

    /// Return the org's Stripe customer ID, creating the customer first if
    /// the org has never been through checkout.
    async fn ensure_customer(&self, org_external_id: &str) -> BillingResult<String> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT name, stripe_customer_id FROM organizations WHERE external_id = $1",
        )
        .bind(org_external_id)
        .fetch_optional(&self.pool)
        .await?;

        let (org_name, existing) = row
            .ok_or_else(|| BillingError::OrganizationNotFound(org_external_id.to_string()))?;

        if let Some(customer_id) = existing {
            return Ok(customer_id);
        }

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_external_id".to_string(), org_external_id.to_string());

        let mut params = CreateCustomer::new();
        params.name = Some(&org_name);
        params.metadata = Some(metadata);

        let customer = Customer::create(self.stripe.inner(), params).await?;

        sqlx::query("UPDATE organizations SET stripe_customer_id = $1, updated_at = NOW() WHERE external_id = $2")
            .bind(customer.id.as_str())
            .bind(org_external_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            org_external_id = %org_external_id,
            customer_id = %customer.id,
            "Created Stripe customer for organization"
        );

        Ok(customer.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_parsing() {
        assert_eq!(BillingInterval::parse("monthly"), Some(BillingInterval::Monthly));
        assert_eq!(BillingInterval::parse("annual"), Some(BillingInterval::Annual));
        assert_eq!(BillingInterval::parse("yearly"), Some(BillingInterval::Annual));
        assert_eq!(BillingInterval::parse("weekly"), None);
        assert_eq!(BillingInterval::parse(""), None);
    }
}
