//! Domain types shared across crates.

use serde::{Deserialize, Serialize};

/// Role of a user within an organization.
///
/// Stored lowercase in `organization_memberships.role`. The identity
/// provider reports roles in several historical formats (`org:owner`,
/// `org:admin`, `basic_member`, plain `admin`); [`OrgRole::parse`]
/// normalizes all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Owner,
    Admin,
    Member,
}

impl OrgRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgRole::Owner => "owner",
            OrgRole::Admin => "admin",
            OrgRole::Member => "member",
        }
    }

    /// Normalize a provider role string. Returns `None` for strings no
    /// known provider format produces.
    pub fn parse(raw: &str) -> Option<Self> {
        let bare = raw.strip_prefix("org:").unwrap_or(raw);
        match bare {
            "owner" => Some(OrgRole::Owner),
            "admin" => Some(OrgRole::Admin),
            "member" | "basic_member" => Some(OrgRole::Member),
            _ => None,
        }
    }

    /// True for roles allowed to manage billing for the organization.
    pub fn can_manage_billing(&self) -> bool {
        matches!(self, OrgRole::Owner | OrgRole::Admin)
    }
}

impl std::fmt::Display for OrgRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription tier for an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Team,
    Enterprise,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Team => "team",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(SubscriptionTier::Free),
            "pro" => Some(SubscriptionTier::Pro),
            "team" => Some(SubscriptionTier::Team),
            "enterprise" => Some(SubscriptionTier::Enterprise),
            _ => None,
        }
    }

    /// Tiers that are purchased through checkout (everything except Free).
    pub fn is_paid(&self) -> bool {
        !matches!(self, SubscriptionTier::Free)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== ROLE NORMALIZATION ====================

    #[test]
    fn parses_prefixed_provider_roles() {
        assert_eq!(OrgRole::parse("org:owner"), Some(OrgRole::Owner));
        assert_eq!(OrgRole::parse("org:admin"), Some(OrgRole::Admin));
        assert_eq!(OrgRole::parse("org:member"), Some(OrgRole::Member));
    }

    #[test]
    fn parses_legacy_roles() {
        assert_eq!(OrgRole::parse("admin"), Some(OrgRole::Admin));
        assert_eq!(OrgRole::parse("basic_member"), Some(OrgRole::Member));
    }

    #[test]
    fn rejects_unknown_roles() {
        assert_eq!(OrgRole::parse("org:billing_manager"), None);
        assert_eq!(OrgRole::parse(""), None);
    }

    #[test]
    fn billing_management_is_owner_or_admin() {
        assert!(OrgRole::Owner.can_manage_billing());
        assert!(OrgRole::Admin.can_manage_billing());
        assert!(!OrgRole::Member.can_manage_billing());
    }

    // ==================== TIER PARSING ====================

    #[test]
    fn tier_round_trips_through_as_str() {
        for tier in [
            SubscriptionTier::Free,
            SubscriptionTier::Pro,
            SubscriptionTier::Team,
            SubscriptionTier::Enterprise,
        ] {
            assert_eq!(SubscriptionTier::parse(tier.as_str()), Some(tier));
        }
    }

    #[test]
    fn only_free_is_unpaid() {
        assert!(!SubscriptionTier::Free.is_paid());
        assert!(SubscriptionTier::Pro.is_paid());
        assert!(SubscriptionTier::Team.is_paid());
        assert!(SubscriptionTier::Enterprise.is_paid());
    }

    #[test]
    fn tier_serializes_lowercase() {
        let json = serde_json::to_string(&SubscriptionTier::Pro).unwrap();
        assert_eq!(json, "\"pro\"");
    }
}
