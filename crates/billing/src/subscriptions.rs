//! Subscription state mirroring
//!
//! Stripe is the source of truth for subscription state; this module keeps
//! the local `subscriptions` table in step so the deletion checker and the
//! admin dashboard can answer billing questions without calling Stripe.

use sqlx::PgPool;
use stripe::{Subscription, SubscriptionStatus as StripeSubStatus};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::BillingResult;

/// Subscription service for webhook-driven state sync and read queries
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Upsert the local mirror of a Stripe subscription.
    ///
    /// Keyed on stripe_subscription_id: a new subscription after a canceled
    /// one gets its own row, and the latest row wins for an org.
    pub async fn sync_subscription_to_db(
        &self,
        org_external_id: &str,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let status = match subscription.status {
            StripeSubStatus::Active => "active",
            StripeSubStatus::PastDue => "past_due",
            StripeSubStatus::Canceled => "canceled",
            StripeSubStatus::Unpaid => "unpaid",
            StripeSubStatus::Trialing => "trialing",
            StripeSubStatus::Incomplete => "incomplete",
            StripeSubStatus::IncompleteExpired => "incomplete_expired",
            StripeSubStatus::Paused => "paused",
        };

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string());

        // Tier from subscription metadata, falling back to the price table.
        let tier = subscription.metadata.get("tier").cloned().or_else(|| {
            price_id
                .as_deref()
                .and_then(|p| self.stripe.config().tier_for_price_id(p))
                .map(|t| t.to_string())
        });

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        let current_period_start =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
                .unwrap_or(OffsetDateTime::now_utc());
        let current_period_end =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
                .unwrap_or(OffsetDateTime::now_utc());

        let trial_start = subscription
            .trial_start
            .map(|t| OffsetDateTime::from_unix_timestamp(t).unwrap_or(OffsetDateTime::now_utc()));
        let trial_end = subscription
            .trial_end
            .map(|t| OffsetDateTime::from_unix_timestamp(t).unwrap_or(OffsetDateTime::now_utc()));

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                org_external_id, stripe_subscription_id, stripe_customer_id,
                status, tier, stripe_price_id, cancel_at_period_end,
                current_period_start, current_period_end, trial_start, trial_end,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                tier = EXCLUDED.tier,
                stripe_price_id = EXCLUDED.stripe_price_id,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                updated_at = NOW()
            "#,
        )
        .bind(org_external_id)
        .bind(subscription.id.as_str())
        .bind(&customer_id)
        .bind(status)
        .bind(&tier)
        .bind(&price_id)
        .bind(subscription.cancel_at_period_end)
        .bind(current_period_start)
        .bind(current_period_end)
        .bind(trial_start)
        .bind(trial_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            org_external_id = %org_external_id,
            subscription_id = %subscription.id,
            status = %status,
            tier = ?tier,
            "Synced subscription to database"
        );

        Ok(())
    }

    /// Mark a subscription canceled without a full Stripe object
    pub async fn mark_canceled(&self, stripe_subscription_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET status = 'canceled', updated_at = NOW() WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether the org currently holds a subscription in a billable state
    pub async fn has_active_subscription(&self, org_external_id: &str) -> BillingResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM subscriptions
                WHERE org_external_id = $1
                  AND status IN ('active', 'trialing', 'past_due')
            )
            "#,
        )
        .bind(org_external_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Map a Stripe customer back to the owning org's external ID
    pub async fn org_for_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<String>> {
        let external_id = sqlx::query_scalar(
            "SELECT external_id FROM organizations WHERE stripe_customer_id = $1",
        )
        .bind(stripe_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(external_id)
    }
}
