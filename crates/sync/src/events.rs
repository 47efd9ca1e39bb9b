//! Identity provider event vocabulary.
//!
//! The provider delivers JSON envelopes of the form
//! `{"type": "user.created", "data": {...}}`. This module names the event
//! types we handle, derives the affected entity from the payload, and
//! defines the typed payload structs the entity writers consume.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Raw webhook envelope, parsed before signature-verified dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Kind of entity a sync workflow operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    User,
    Organization,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Organization => "organization",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(EntityType::User),
            "organization" => Some(EntityType::Organization),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The twelve provider events the sync engine understands.
///
/// Membership and domain events are organization-scoped: they sync under
/// the owning organization's entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityEventKind {
    UserCreated,
    UserUpdated,
    UserDeleted,
    OrganizationCreated,
    OrganizationUpdated,
    OrganizationDeleted,
    MembershipCreated,
    MembershipUpdated,
    MembershipDeleted,
    DomainCreated,
    DomainUpdated,
    DomainDeleted,
}

impl IdentityEventKind {
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "user.created" => Some(Self::UserCreated),
            "user.updated" => Some(Self::UserUpdated),
            "user.deleted" => Some(Self::UserDeleted),
            "organization.created" => Some(Self::OrganizationCreated),
            "organization.updated" => Some(Self::OrganizationUpdated),
            "organization.deleted" => Some(Self::OrganizationDeleted),
            "organizationMembership.created" => Some(Self::MembershipCreated),
            "organizationMembership.updated" => Some(Self::MembershipUpdated),
            "organizationMembership.deleted" => Some(Self::MembershipDeleted),
            "organizationDomain.created" => Some(Self::DomainCreated),
            "organizationDomain.updated" => Some(Self::DomainUpdated),
            "organizationDomain.deleted" => Some(Self::DomainDeleted),
            _ => None,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::UserCreated | Self::UserUpdated | Self::UserDeleted => EntityType::User,
            _ => EntityType::Organization,
        }
    }
}

/// Derive the (entity type, entity id) pair a payload refers to.
///
/// Errors are non-retryable: a payload missing its id will still be
/// missing it on redelivery.
pub fn entity_ref(kind: IdentityEventKind, data: &serde_json::Value) -> SyncResult<(EntityType, String)> {
    let entity_type = kind.entity_type();
    let id = match kind {
        IdentityEventKind::MembershipCreated
        | IdentityEventKind::MembershipUpdated
        | IdentityEventKind::MembershipDeleted => data
            .get("organization")
            .and_then(|o| o.get("id"))
            .and_then(|v| v.as_str()),
        IdentityEventKind::DomainCreated
        | IdentityEventKind::DomainUpdated
        | IdentityEventKind::DomainDeleted => data.get("organization_id").and_then(|v| v.as_str()),
        _ => data.get("id").and_then(|v| v.as_str()),
    };

    match id {
        Some(id) if !id.is_empty() => Ok((entity_type, id.to_string())),
        _ => Err(SyncError::Payload(format!(
            "no entity id in payload for {entity_type} event"
        ))),
    }
}

// ==================== TYPED PAYLOADS ====================

#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    pub id: String,
    #[serde(default)]
    pub email_addresses: Vec<EmailAddress>,
    #[serde(default)]
    pub primary_email_address_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAddress {
    pub id: String,
    pub email_address: String,
}

impl UserPayload {
    /// The primary email address, falling back to the first one listed.
    pub fn primary_email(&self) -> Option<&str> {
        if let Some(primary_id) = &self.primary_email_address_id {
            if let Some(found) = self.email_addresses.iter().find(|e| &e.id == primary_id) {
                return Some(found.email_address.as_str());
            }
        }
        self.email_addresses.first().map(|e| e.email_address.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationPayload {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipPayload {
    pub organization: OrganizationRef,
    pub public_user_data: PublicUserData,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicUserData {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainPayload {
    #[serde(default)]
    pub organization_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub enrollment_mode: Option<String>,
    #[serde(default)]
    pub verification: Option<DomainVerification>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainVerification {
    pub status: String,
}

/// Payload shape for `user.deleted` and `organization.deleted`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeletedPayload {
    pub id: String,
}

/// Deserialize a typed payload out of the raw event data.
pub fn parse_payload<T: serde::de::DeserializeOwned>(data: &serde_json::Value) -> SyncResult<T> {
    serde_json::from_value(data.clone())
        .map_err(|e| SyncError::Payload(format!("payload did not match expected shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ==================== EVENT KIND PARSING ====================

    #[test]
    fn parses_all_handled_event_types() {
        let names = [
            "user.created",
            "user.updated",
            "user.deleted",
            "organization.created",
            "organization.updated",
            "organization.deleted",
            "organizationMembership.created",
            "organizationMembership.updated",
            "organizationMembership.deleted",
            "organizationDomain.created",
            "organizationDomain.updated",
            "organizationDomain.deleted",
        ];
        for name in names {
            assert!(IdentityEventKind::parse(name).is_some(), "unparsed: {name}");
        }
    }

    #[test]
    fn unknown_event_types_are_none() {
        assert!(IdentityEventKind::parse("session.created").is_none());
        assert!(IdentityEventKind::parse("email.created").is_none());
        assert!(IdentityEventKind::parse("").is_none());
    }

    #[test]
    fn membership_and_domain_events_are_organization_scoped() {
        assert_eq!(
            IdentityEventKind::MembershipCreated.entity_type(),
            EntityType::Organization
        );
        assert_eq!(
            IdentityEventKind::DomainDeleted.entity_type(),
            EntityType::Organization
        );
        assert_eq!(IdentityEventKind::UserUpdated.entity_type(), EntityType::User);
    }

    // ==================== ENTITY DERIVATION ====================

    #[test]
    fn derives_user_entity_from_top_level_id() {
        let data = json!({"id": "user_abc", "first_name": "Ada"});
        let (entity_type, id) = entity_ref(IdentityEventKind::UserCreated, &data).unwrap();
        assert_eq!(entity_type, EntityType::User);
        assert_eq!(id, "user_abc");
    }

    #[test]
    fn derives_membership_entity_from_nested_organization() {
        let data = json!({
            "organization": {"id": "org_123"},
            "public_user_data": {"user_id": "user_abc"},
            "role": "org:member"
        });
        let (entity_type, id) = entity_ref(IdentityEventKind::MembershipUpdated, &data).unwrap();
        assert_eq!(entity_type, EntityType::Organization);
        assert_eq!(id, "org_123");
    }

    #[test]
    fn derives_domain_entity_from_organization_id_field() {
        let data = json!({"organization_id": "org_9", "name": "acme.dev"});
        let (_, id) = entity_ref(IdentityEventKind::DomainCreated, &data).unwrap();
        assert_eq!(id, "org_9");
    }

    #[test]
    fn missing_entity_id_is_a_payload_error() {
        let data = json!({"first_name": "Ada"});
        let err = entity_ref(IdentityEventKind::UserCreated, &data).unwrap_err();
        assert!(matches!(err, SyncError::Payload(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_entity_id_is_a_payload_error() {
        let data = json!({"id": ""});
        assert!(entity_ref(IdentityEventKind::OrganizationCreated, &data).is_err());
    }

    // ==================== TYPED PAYLOADS ====================

    #[test]
    fn primary_email_prefers_the_flagged_address() {
        let user: UserPayload = parse_payload(&json!({
            "id": "user_1",
            "primary_email_address_id": "em_2",
            "email_addresses": [
                {"id": "em_1", "email_address": "old@example.com"},
                {"id": "em_2", "email_address": "ada@example.com"}
            ]
        }))
        .unwrap();
        assert_eq!(user.primary_email(), Some("ada@example.com"));
    }

    #[test]
    fn primary_email_falls_back_to_first_listed() {
        let user: UserPayload = parse_payload(&json!({
            "id": "user_1",
            "email_addresses": [
                {"id": "em_1", "email_address": "only@example.com"}
            ]
        }))
        .unwrap();
        assert_eq!(user.primary_email(), Some("only@example.com"));
    }

    #[test]
    fn user_with_no_emails_has_none() {
        let user: UserPayload = parse_payload(&json!({"id": "user_1"})).unwrap();
        assert_eq!(user.primary_email(), None);
    }

    #[test]
    fn malformed_membership_payload_is_rejected() {
        let err = parse_payload::<MembershipPayload>(&json!({"role": "org:admin"})).unwrap_err();
        assert!(matches!(err, SyncError::Payload(_)));
    }
}
