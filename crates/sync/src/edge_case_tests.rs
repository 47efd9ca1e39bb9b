// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Entity Sync
//!
//! Tests critical boundary conditions in:
//! - Webhook signature verification (SYNC-V01 to SYNC-V05)
//! - Event entity derivation (SYNC-E01 to SYNC-E04)
//! - Deletion decision table (SYNC-D01 to SYNC-D07)
//! - Failure classification (SYNC-F01 to SYNC-F03)

#[cfg(test)]
mod signature_tests {
    use crate::webhooks::{WebhookHeaders, WebhookVerifier};
    use time::OffsetDateTime;

    fn now_ts() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn headers_signed_at(v: &WebhookVerifier, message_id: &str, ts: i64, payload: &str) -> WebhookHeaders {
        let ts = ts.to_string();
        let signature = format!("v1,{}", v.sign(message_id, &ts, payload).unwrap());
        WebhookHeaders {
            message_id: message_id.to_string(),
            timestamp: ts,
            signature,
        }
    }

    // =========================================================================
    // SYNC-V01: Signature over current timestamp verifies
    // =========================================================================
    #[test]
    fn test_fresh_signature_verifies() {
        let v = WebhookVerifier::new("whsec_c2VjcmV0LWtleS1mb3ItdGVzdHM=");
        let payload = r#"{"type":"organization.created","data":{"id":"org_1"}}"#;
        let headers = headers_signed_at(&v, "msg_fresh", now_ts(), payload);
        assert!(v.verify(&headers, payload).is_ok());
    }

    // =========================================================================
    // SYNC-V02: Replay with a 10-minute-old timestamp is rejected
    // =========================================================================
    #[test]
    fn test_old_replay_rejected() {
        let v = WebhookVerifier::new("whsec_c2VjcmV0LWtleS1mb3ItdGVzdHM=");
        let payload = r#"{"type":"organization.created","data":{"id":"org_1"}}"#;
        let headers = headers_signed_at(&v, "msg_old", now_ts() - 600, payload);
        assert!(v.verify(&headers, payload).is_err());
    }

    // =========================================================================
    // SYNC-V03: Future-dated timestamp beyond tolerance is rejected
    // =========================================================================
    #[test]
    fn test_future_timestamp_rejected() {
        let v = WebhookVerifier::new("whsec_c2VjcmV0LWtleS1mb3ItdGVzdHM=");
        let payload = "{}";
        let headers = headers_signed_at(&v, "msg_future", now_ts() + 600, payload);
        assert!(v.verify(&headers, payload).is_err());
    }

    // =========================================================================
    // SYNC-V04: Signature computed under a different secret never passes
    // =========================================================================
    #[test]
    fn test_wrong_secret_rejected() {
        let signer = WebhookVerifier::new("whsec_a2V5LW9uZQ==");
        let verifier = WebhookVerifier::new("whsec_a2V5LXR3bw==");
        let payload = "{}";
        let headers = headers_signed_at(&signer, "msg_x", now_ts(), payload);
        assert!(verifier.verify(&headers, payload).is_err());
    }

    // =========================================================================
    // SYNC-V05: Empty signature header has no candidates and is rejected
    // =========================================================================
    #[test]
    fn test_empty_signature_header_rejected() {
        let v = WebhookVerifier::new("whsec_c2VjcmV0LWtleS1mb3ItdGVzdHM=");
        let headers = WebhookHeaders {
            message_id: "msg_x".into(),
            timestamp: now_ts().to_string(),
            signature: String::new(),
        };
        assert!(v.verify(&headers, "{}").is_err());
    }
}

#[cfg(test)]
mod event_derivation_tests {
    use crate::events::{entity_ref, EntityType, IdentityEventKind};
    use serde_json::json;

    // =========================================================================
    // SYNC-E01: All twelve event kinds derive an entity from a full payload
    // =========================================================================
    #[test]
    fn test_every_kind_derives_from_canonical_payload() {
        let cases = [
            ("user.created", json!({"id": "user_1"})),
            ("user.updated", json!({"id": "user_1"})),
            ("user.deleted", json!({"id": "user_1", "deleted": true})),
            ("organization.created", json!({"id": "org_1"})),
            ("organization.updated", json!({"id": "org_1"})),
            ("organization.deleted", json!({"id": "org_1", "deleted": true})),
            (
                "organizationMembership.created",
                json!({"organization": {"id": "org_1"}, "public_user_data": {"user_id": "user_1"}, "role": "org:member"}),
            ),
            (
                "organizationMembership.updated",
                json!({"organization": {"id": "org_1"}, "public_user_data": {"user_id": "user_1"}, "role": "org:admin"}),
            ),
            (
                "organizationMembership.deleted",
                json!({"organization": {"id": "org_1"}, "public_user_data": {"user_id": "user_1"}, "role": "org:member"}),
            ),
            ("organizationDomain.created", json!({"organization_id": "org_1", "name": "a.dev"})),
            ("organizationDomain.updated", json!({"organization_id": "org_1", "name": "a.dev"})),
            ("organizationDomain.deleted", json!({"organization_id": "org_1", "name": "a.dev"})),
        ];

        for (event_type, data) in cases {
            let kind = IdentityEventKind::parse(event_type).unwrap();
            let (_, id) = entity_ref(kind, &data)
                .unwrap_or_else(|e| panic!("{event_type} failed to derive: {e}"));
            assert!(!id.is_empty());
        }
    }

    // =========================================================================
    // SYNC-E02: Membership events sync under the organization, not the user
    // =========================================================================
    #[test]
    fn test_membership_scopes_to_organization() {
        let data = json!({
            "organization": {"id": "org_77"},
            "public_user_data": {"user_id": "user_3"},
            "role": "org:member"
        });
        let (entity_type, id) = entity_ref(IdentityEventKind::MembershipDeleted, &data).unwrap();
        assert_eq!(entity_type, EntityType::Organization);
        assert_eq!(id, "org_77");
    }

    // =========================================================================
    // SYNC-E03: Membership payload missing its organization is non-retryable
    // =========================================================================
    #[test]
    fn test_membership_without_org_is_payload_error() {
        let data = json!({"public_user_data": {"user_id": "user_3"}, "role": "org:member"});
        let err = entity_ref(IdentityEventKind::MembershipCreated, &data).unwrap_err();
        assert!(!err.is_retryable());
    }

    // =========================================================================
    // SYNC-E04: Entity id of the wrong JSON type is treated as missing
    // =========================================================================
    #[test]
    fn test_numeric_id_is_rejected() {
        let data = json!({"id": 42});
        assert!(entity_ref(IdentityEventKind::UserCreated, &data).is_err());
    }
}

#[cfg(test)]
mod deletion_decision_tests {
    use crate::deletion::{decide_membership, RequiredAction};
    use certiva_shared::OrgRole;

    const BOOLS: [bool; 2] = [false, true];

    // =========================================================================
    // SYNC-D01: Admins and members are auto-deletable in every org state
    // =========================================================================
    #[test]
    fn test_non_owners_always_auto_deletable() {
        for role in [OrgRole::Admin, OrgRole::Member] {
            for co_owner in BOOLS {
                for other_admin in BOOLS {
                    for sub in BOOLS {
                        let d = decide_membership(role, co_owner, other_admin, sub);
                        assert!(d.auto_deletable, "{role:?} blocked at ({co_owner},{other_admin},{sub})");
                        assert_eq!(d.required_action, RequiredAction::LeaveOrganization);
                    }
                }
            }
        }
    }

    // =========================================================================
    // SYNC-D02: A co-owner releases the departing owner in every org state
    // =========================================================================
    #[test]
    fn test_co_owner_always_releases() {
        for other_admin in BOOLS {
            for sub in BOOLS {
                let d = decide_membership(OrgRole::Owner, true, other_admin, sub);
                assert!(d.auto_deletable);
                assert_eq!(d.required_action, RequiredAction::LeaveOrganization);
            }
        }
    }

    // =========================================================================
    // SYNC-D03: A sole owner is never auto-deletable
    // =========================================================================
    #[test]
    fn test_sole_owner_never_auto_deletable() {
        for other_admin in BOOLS {
            for sub in BOOLS {
                let d = decide_membership(OrgRole::Owner, false, other_admin, sub);
                assert!(!d.auto_deletable);
                assert_ne!(d.required_action, RequiredAction::LeaveOrganization);
            }
        }
    }

    // =========================================================================
    // SYNC-D04: Sole owner + blocking subscription + no other admin
    //           requires canceling the subscription
    // =========================================================================
    #[test]
    fn test_sole_owner_with_subscription_no_admin() {
        let d = decide_membership(OrgRole::Owner, false, false, true);
        assert_eq!(d.required_action, RequiredAction::CancelSubscription);
    }

    // =========================================================================
    // SYNC-D05: Sole owner with another admin requires ownership transfer,
    //           with or without a subscription
    // =========================================================================
    #[test]
    fn test_sole_owner_with_admin_transfers() {
        for sub in BOOLS {
            let d = decide_membership(OrgRole::Owner, false, true, sub);
            assert_eq!(d.required_action, RequiredAction::TransferOwnership);
        }
    }

    // =========================================================================
    // SYNC-D06: Sole owner of an idle org must delete or hand it off
    // =========================================================================
    #[test]
    fn test_sole_owner_idle_org() {
        let d = decide_membership(OrgRole::Owner, false, false, false);
        assert_eq!(d.required_action, RequiredAction::DeleteOrganization);
    }

    // =========================================================================
    // SYNC-D07: The decision is a pure function (same facts, same answer)
    // =========================================================================
    #[test]
    fn test_decision_is_deterministic() {
        for role in [OrgRole::Owner, OrgRole::Admin, OrgRole::Member] {
            for co_owner in BOOLS {
                for other_admin in BOOLS {
                    for sub in BOOLS {
                        let a = decide_membership(role, co_owner, other_admin, sub);
                        let b = decide_membership(role, co_owner, other_admin, sub);
                        assert_eq!(a, b);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod failure_classification_tests {
    use crate::error::SyncError;

    // =========================================================================
    // SYNC-F01: Infrastructure failures are retryable
    // =========================================================================
    #[test]
    fn test_transient_failures_retryable() {
        assert!(SyncError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(SyncError::Identity("connection reset".into()).is_retryable());
    }

    // =========================================================================
    // SYNC-F02: Malformed payloads are terminal
    // =========================================================================
    #[test]
    fn test_payload_failures_not_retryable() {
        assert!(!SyncError::Payload("missing field".into()).is_retryable());
        assert!(!SyncError::UnsupportedEvent("session.created".into()).is_retryable());
    }

    // =========================================================================
    // SYNC-F03: Dead letter state rejections are terminal
    // =========================================================================
    #[test]
    fn test_state_machine_rejections_not_retryable() {
        assert!(!SyncError::NotRetryable.is_retryable());
        assert!(!SyncError::AlreadyResolved.is_retryable());
        assert!(!SyncError::RetryInFlight.is_retryable());
        assert!(!SyncError::PayloadUnavailable.is_retryable());
    }
}
