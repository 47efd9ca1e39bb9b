// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Certiva Billing Module
//!
//! Stripe glue for paid tiers. Checkout and the billing portal are the only
//! write paths; everything else is webhook-driven state mirroring.
//!
//! ## Features
//!
//! - **Checkout**: Hosted checkout sessions for tier upgrades
//! - **Portal**: Stripe billing portal for self-service plan changes
//! - **Subscriptions**: Local mirror of subscription state
//! - **Webhooks**: Verified, idempotent Stripe event handling

pub mod checkout;
pub mod client;
pub mod error;
pub mod portal;
pub mod subscriptions;
pub mod webhooks;

// Checkout
pub use checkout::{BillingInterval, CheckoutResponse, CheckoutService};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Portal
pub use portal::{PortalResponse, PortalService};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            portal: PortalService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool),
        }
    }
}
