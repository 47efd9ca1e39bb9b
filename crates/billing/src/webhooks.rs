//! Stripe webhook handling
//!
//! Verifies and processes the slim set of Stripe events this platform
//! cares about: subscription lifecycle and checkout completion. Everything
//! else is acknowledged and logged.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{CheckoutSession, Event, EventObject, EventType, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Stripe signature headers carry `t=<unix>,v1=<hex hmac>` pairs. Recompute
/// the HMAC over `t.payload` and compare against every v1 candidate.
fn verify_signature_manually(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
) -> BillingResult<()> {
    let fields: Vec<(&str, &str)> = signature
        .split(',')
        .filter_map(|part| part.split_once('='))
        .collect();

    let timestamp: i64 = fields
        .iter()
        .find(|(k, _)| *k == "t")
        .and_then(|(_, v)| v.parse().ok())
        .ok_or_else(|| {
            tracing::error!("Signature header missing parsable timestamp");
            BillingError::WebhookSignatureInvalid
        })?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > 300 {
        tracing::error!(timestamp, now, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret starts with "whsec_"; the remainder is the HMAC key
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    let matched = fields
        .iter()
        .any(|(k, v)| *k == "v1" && *v == computed.as_str());
    if !matched {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Tries the library's standard verification first, then falls back to
    /// manual signature verification for API versions the library's event
    /// parser rejects.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        verify_signature_manually(payload, signature, webhook_secret)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Uses INSERT...ON CONFLICT...RETURNING to atomically claim exclusive
    /// processing rights, so concurrent deliveries of the same event cannot
    /// both run. Events stuck in 'processing' for over 30 minutes can be
    /// re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 * INTERVAL '1 minute')
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
            )
            .bind(&event_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                existing_status = existing.as_ref().map(|(s,)| s.as_str()),
                "Duplicate Stripe event, claim already held"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Claimed Stripe webhook event for processing"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        self.record_outcome(&event_id, processing_result, error_message.as_deref())
            .await;

        result
    }

    /// Write the claim row's final status. Retries once; a row left in
    /// 'processing' blocks redelivery for the full timeout window.
    async fn record_outcome(&self, event_id: &str, status: &str, error_message: Option<&str>) {
        for attempt in 1..=2 {
            let update = sqlx::query(
                r#"
                UPDATE stripe_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE stripe_event_id = $3
                "#,
            )
            .bind(status)
            .bind(error_message)
            .bind(event_id)
            .execute(&self.pool)
            .await;

            match update {
                Ok(_) => return,
                Err(e) if attempt == 1 => {
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Failed to finalize webhook claim row, retrying"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        status = %status,
                        error = %e,
                        "Could not finalize webhook claim row after retry. \
                         The event may sit in 'processing' until the stuck-claim \
                         timeout expires."
                    );
                }
            }
        }
    }

    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let event_owned = event.clone();

        match event.type_ {
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_synced(event_owned).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event_owned).await?;
            }
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event_owned).await?;
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    async fn handle_subscription_synced(&self, event: Event) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;
        let org_external_id = self.org_for_subscription(&subscription).await?;

        let subscriptions = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        subscriptions
            .sync_subscription_to_db(&org_external_id, &subscription)
            .await?;

        tracing::info!(
            org_external_id = %org_external_id,
            subscription_id = %subscription.id,
            status = ?subscription.status,
            "Subscription state synced from webhook"
        );

        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;
        let org_external_id = self.org_for_subscription(&subscription).await?;

        let subscriptions = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        subscriptions
            .sync_subscription_to_db(&org_external_id, &subscription)
            .await?;
        // The deleted event sometimes arrives with a non-terminal snapshot
        // status; force the local row terminal either way.
        subscriptions.mark_canceled(subscription.id.as_str()).await?;

        tracing::info!(
            org_external_id = %org_external_id,
            subscription_id = %subscription.id,
            "Subscription canceled"
        );

        Ok(())
    }

    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = self.extract_session(event)?;

        let org_external_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("org_external_id").cloned())
            .or_else(|| session.client_reference_id.clone());

        let Some(org_external_id) = org_external_id else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout session completed without an org reference, skipping"
            );
            return Ok(());
        };

        // Backfill the customer link in case the org row predates checkout
        // customer creation (restored databases, manual fixes).
        if let Some(customer) = &session.customer {
            let customer_id = match customer {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(c) => c.id.to_string(),
            };
            sqlx::query(
                r#"
                UPDATE organizations SET stripe_customer_id = $1, updated_at = NOW()
                WHERE external_id = $2 AND stripe_customer_id IS NULL
                "#,
            )
            .bind(&customer_id)
            .bind(&org_external_id)
            .execute(&self.pool)
            .await?;
        }

        tracing::info!(
            org_external_id = %org_external_id,
            session_id = %session.id,
            "Checkout session completed"
        );

        Ok(())
    }

    fn extract_subscription(&self, event: Event) -> BillingResult<Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Subscription".to_string(),
            )),
        }
    }

    fn extract_session(&self, event: Event) -> BillingResult<CheckoutSession> {
        match event.data.object {
            EventObject::CheckoutSession(session) => Ok(session),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected CheckoutSession".to_string(),
            )),
        }
    }

    /// Resolve the org an event belongs to: subscription metadata first,
    /// then the customer link on the organizations table.
    async fn org_for_subscription(&self, subscription: &Subscription) -> BillingResult<String> {
        if let Some(org_external_id) = subscription.metadata.get("org_external_id") {
            return Ok(org_external_id.clone());
        }

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        let subscriptions = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        subscriptions
            .org_for_customer(&customer_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "No organization found for Stripe customer {}",
                    customer_id
                ))
            })
    }
}
