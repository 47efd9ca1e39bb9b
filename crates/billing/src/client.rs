//! Stripe client configuration

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};

/// Stripe price IDs per tier and billing interval.
///
/// Free has no price; Enterprise is sales-led and priced per contract,
/// so neither appears here.
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub pro_monthly: Option<String>,
    pub pro_annual: Option<String>,
    pub team_monthly: Option<String>,
    pub team_annual: Option<String>,
}

/// Stripe configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub portal_return_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = require_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;

        let price_ids = PriceIds {
            pro_monthly: optional_env("STRIPE_PRICE_PRO_MONTHLY"),
            pro_annual: optional_env("STRIPE_PRICE_PRO_ANNUAL"),
            team_monthly: optional_env("STRIPE_PRICE_TEAM_MONTHLY"),
            team_annual: optional_env("STRIPE_PRICE_TEAM_ANNUAL"),
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids,
            checkout_success_url: require_env("CHECKOUT_SUCCESS_URL")?,
            checkout_cancel_url: require_env("CHECKOUT_CANCEL_URL")?,
            portal_return_url: require_env("PORTAL_RETURN_URL")?,
        })
    }

    /// Monthly price ID for a tier, if one is configured
    pub fn price_id_for_tier(&self, tier: &str) -> Option<&str> {
        match tier {
            "pro" => self.price_ids.pro_monthly.as_deref(),
            "team" => self.price_ids.team_monthly.as_deref(),
            _ => None,
        }
    }

    /// Annual price ID for a tier, if one is configured
    pub fn annual_price_id_for_tier(&self, tier: &str) -> Option<&str> {
        match tier {
            "pro" => self.price_ids.pro_annual.as_deref(),
            "team" => self.price_ids.team_annual.as_deref(),
            _ => None,
        }
    }

    /// Reverse lookup: which tier does a Stripe price belong to
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<&'static str> {
        let matches = |slot: &Option<String>| slot.as_deref() == Some(price_id);
        if matches(&self.price_ids.pro_monthly) || matches(&self.price_ids.pro_annual) {
            Some("pro")
        } else if matches(&self.price_ids.team_monthly) || matches(&self.price_ids.team_annual) {
            Some("team")
        } else {
            None
        }
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} not set", name)))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Shared Stripe client. Cheap to clone, hand one to each service.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_x".into(),
            webhook_secret: "whsec_x".into(),
            price_ids: PriceIds {
                pro_monthly: Some("price_pro_m".into()),
                pro_annual: Some("price_pro_a".into()),
                team_monthly: Some("price_team_m".into()),
                team_annual: None,
            },
            checkout_success_url: "https://app.certiva.io/billing/success".into(),
            checkout_cancel_url: "https://app.certiva.io/billing".into(),
            portal_return_url: "https://app.certiva.io/billing".into(),
        }
    }

    #[test]
    fn test_price_lookup_by_tier_and_interval() {
        let config = test_config();
        assert_eq!(config.price_id_for_tier("pro"), Some("price_pro_m"));
        assert_eq!(config.annual_price_id_for_tier("pro"), Some("price_pro_a"));
        assert_eq!(config.price_id_for_tier("team"), Some("price_team_m"));
        assert_eq!(config.annual_price_id_for_tier("team"), None);
        assert_eq!(config.price_id_for_tier("free"), None);
        assert_eq!(config.price_id_for_tier("enterprise"), None);
    }

    #[test]
    fn test_tier_reverse_lookup() {
        let config = test_config();
        assert_eq!(config.tier_for_price_id("price_pro_a"), Some("pro"));
        assert_eq!(config.tier_for_price_id("price_team_m"), Some("team"));
        assert_eq!(config.tier_for_price_id("price_unknown"), None);
    }
}
