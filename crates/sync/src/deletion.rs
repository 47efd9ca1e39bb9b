//! Account deletion eligibility.
//!
//! Whether a user can delete their account depends on every organization
//! they belong to: ordinary memberships just get left behind, but a sole
//! owner has obligations that must be handed off or wound down first.
//! The decision for one membership is a pure function of four facts
//! (role, co-owner present, other admin present, blocking subscription),
//! so it lives in [`decide_membership`] where it can be tested
//! exhaustively; the checker just gathers those facts with one query.
//!
//! A subscription blocks deletion when its status is active, trialing,
//! or past_due and it is not already scheduled to cancel at period end.

use serde::Serialize;
use sqlx::{FromRow, PgPool};

use certiva_shared::OrgRole;

use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityClient;

/// What must happen to a membership before (or as part of) account
/// deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAction {
    /// Membership can be removed automatically during deletion.
    LeaveOrganization,
    /// Another member must be promoted to owner first.
    TransferOwnership,
    /// The organization's subscription must be canceled first.
    CancelSubscription,
    /// Sole owner of an idle organization: delete it or hand it off.
    DeleteOrganization,
}

/// Decision for one membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipDecision {
    pub required_action: RequiredAction,
    pub auto_deletable: bool,
}

/// The decision table. `has_blocking_subscription` already folds in the
/// cancel-at-period-end exemption.
pub fn decide_membership(
    role: OrgRole,
    has_co_owner: bool,
    has_other_admin: bool,
    has_blocking_subscription: bool,
) -> MembershipDecision {
    match role {
        // Non-owners never block deletion, whatever the org's state.
        OrgRole::Admin | OrgRole::Member => MembershipDecision {
            required_action: RequiredAction::LeaveOrganization,
            auto_deletable: true,
        },
        // Another owner remains to carry the org.
        OrgRole::Owner if has_co_owner => MembershipDecision {
            required_action: RequiredAction::LeaveOrganization,
            auto_deletable: true,
        },
        // Sole owner: someone or something must take over.
        OrgRole::Owner => {
            let required_action = if has_blocking_subscription {
                if has_other_admin {
                    RequiredAction::TransferOwnership
                } else {
                    RequiredAction::CancelSubscription
                }
            } else if has_other_admin {
                RequiredAction::TransferOwnership
            } else {
                RequiredAction::DeleteOrganization
            };
            MembershipDecision {
                required_action,
                auto_deletable: false,
            }
        }
    }
}

/// Per-organization slice of the eligibility report.
#[derive(Debug, Clone, Serialize)]
pub struct OrgDeletionStatus {
    pub org_external_id: String,
    pub org_name: Option<String>,
    pub role: String,
    pub required_action: RequiredAction,
    pub auto_deletable: bool,
    pub active_subscription: bool,
    pub cancel_scheduled: bool,
}

/// Full eligibility report for one user.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionCheck {
    pub can_delete: bool,
    pub blockers: Vec<String>,
    pub organizations: Vec<OrgDeletionStatus>,
}

/// Outcome of an executed deletion.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionResult {
    pub memberships_removed: usize,
    pub provider_deleted: bool,
}

#[derive(Debug, FromRow)]
struct MembershipFactsRow {
    org_external_id: String,
    org_name: Option<String>,
    role: String,
    has_co_owner: bool,
    has_other_admin: bool,
    has_blocking_subscription: bool,
    has_cancel_scheduled_subscription: bool,
}

#[derive(Clone)]
pub struct DeletionChecker {
    pool: PgPool,
    identity: Option<IdentityClient>,
}

impl DeletionChecker {
    pub fn new(pool: PgPool, identity: Option<IdentityClient>) -> Self {
        Self { pool, identity }
    }

    /// Evaluate deletion eligibility without changing anything.
    pub async fn check(&self, user_external_id: &str) -> SyncResult<DeletionCheck> {
        let rows: Vec<MembershipFactsRow> = sqlx::query_as(
            r#"
            SELECT
                m.org_external_id,
                o.name AS org_name,
                m.role,
                EXISTS (
                    SELECT 1 FROM organization_memberships co
                    WHERE co.org_external_id = m.org_external_id
                      AND co.user_external_id <> m.user_external_id
                      AND co.role = 'owner'
                ) AS has_co_owner,
                EXISTS (
                    SELECT 1 FROM organization_memberships adm
                    WHERE adm.org_external_id = m.org_external_id
                      AND adm.user_external_id <> m.user_external_id
                      AND adm.role = 'admin'
                ) AS has_other_admin,
                EXISTS (
                    SELECT 1 FROM subscriptions s
                    WHERE s.org_external_id = m.org_external_id
                      AND s.status IN ('active', 'trialing', 'past_due')
                      AND s.cancel_at_period_end = FALSE
                ) AS has_blocking_subscription,
                EXISTS (
                    SELECT 1 FROM subscriptions s
                    WHERE s.org_external_id = m.org_external_id
                      AND s.status IN ('active', 'trialing', 'past_due')
                      AND s.cancel_at_period_end = TRUE
                ) AS has_cancel_scheduled_subscription
            FROM organization_memberships m
            LEFT JOIN organizations o ON o.external_id = m.org_external_id
            WHERE m.user_external_id = $1
            ORDER BY o.name NULLS LAST, m.org_external_id
            "#,
        )
        .bind(user_external_id)
        .fetch_all(&self.pool)
        .await?;

        let mut organizations = Vec::with_capacity(rows.len());
        let mut blockers = Vec::new();

        for row in rows {
            // Roles in this table come from our own normalization, so an
            // unparseable one is treated as the least-privileged case.
            let role = OrgRole::parse(&row.role).unwrap_or(OrgRole::Member);
            let decision = decide_membership(
                role,
                row.has_co_owner,
                row.has_other_admin,
                row.has_blocking_subscription,
            );

            if !decision.auto_deletable {
                blockers.push(blocker_message(
                    decision.required_action,
                    row.org_name.as_deref(),
                    &row.org_external_id,
                ));
            }

            organizations.push(OrgDeletionStatus {
                org_external_id: row.org_external_id,
                org_name: row.org_name,
                role: row.role,
                required_action: decision.required_action,
                auto_deletable: decision.auto_deletable,
                active_subscription: row.has_blocking_subscription,
                cancel_scheduled: row.has_cancel_scheduled_subscription,
            });
        }

        Ok(DeletionCheck {
            can_delete: blockers.is_empty(),
            blockers,
            organizations,
        })
    }

    /// Delete the account at the identity provider after a fresh
    /// eligibility check.
    ///
    /// Memberships are removed first, then the user; the provider's
    /// webhooks bring the mirror tables in line. A failure partway
    /// through leaves provider state ahead of the mirror, which the
    /// webhook stream reconciles.
    pub async fn execute(&self, user_external_id: &str) -> SyncResult<DeletionResult> {
        let check = self.check(user_external_id).await?;
        if !check.can_delete {
            tracing::info!(
                user_id = %user_external_id,
                blockers = check.blockers.len(),
                "Account deletion blocked by eligibility check"
            );
            return Err(SyncError::DeletionBlocked(check));
        }

        let identity = self.identity.as_ref().ok_or(SyncError::IdentityNotConfigured)?;

        let mut memberships_removed = 0;
        for org in &check.organizations {
            identity
                .delete_membership(&org.org_external_id, user_external_id)
                .await?;
            memberships_removed += 1;
            tracing::info!(
                user_id = %user_external_id,
                org_id = %org.org_external_id,
                "Membership removed at provider during account deletion"
            );
        }

        identity.delete_user(user_external_id).await?;

        tracing::info!(
            user_id = %user_external_id,
            memberships_removed,
            "Account deleted at identity provider"
        );

        Ok(DeletionResult {
            memberships_removed,
            provider_deleted: true,
        })
    }
}

fn blocker_message(action: RequiredAction, org_name: Option<&str>, org_id: &str) -> String {
    let display_name = org_name.unwrap_or(org_id);
    match action {
        RequiredAction::TransferOwnership => format!(
            "Organization '{display_name}' needs its ownership transferred before your account can be deleted"
        ),
        RequiredAction::CancelSubscription => format!(
            "Organization '{display_name}' has an active subscription that must be canceled first"
        ),
        RequiredAction::DeleteOrganization => format!(
            "Organization '{display_name}' would be left without an owner; delete it or transfer ownership first"
        ),
        // Not a blocker; kept for match completeness.
        RequiredAction::LeaveOrganization => {
            format!("Organization '{display_name}' membership will be removed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== DECISION TABLE BASICS ====================

    #[test]
    fn plain_members_never_block() {
        let d = decide_membership(OrgRole::Member, false, false, true);
        assert_eq!(d.required_action, RequiredAction::LeaveOrganization);
        assert!(d.auto_deletable);
    }

    #[test]
    fn admins_never_block_even_with_subscriptions() {
        let d = decide_membership(OrgRole::Admin, false, false, true);
        assert!(d.auto_deletable);
    }

    #[test]
    fn co_owned_orgs_release_the_departing_owner() {
        let d = decide_membership(OrgRole::Owner, true, false, true);
        assert_eq!(d.required_action, RequiredAction::LeaveOrganization);
        assert!(d.auto_deletable);
    }

    #[test]
    fn sole_owner_with_subscription_and_no_admin_must_cancel() {
        let d = decide_membership(OrgRole::Owner, false, false, true);
        assert_eq!(d.required_action, RequiredAction::CancelSubscription);
        assert!(!d.auto_deletable);
    }

    #[test]
    fn sole_owner_with_subscription_and_an_admin_transfers() {
        let d = decide_membership(OrgRole::Owner, false, true, true);
        assert_eq!(d.required_action, RequiredAction::TransferOwnership);
        assert!(!d.auto_deletable);
    }

    #[test]
    fn sole_owner_of_idle_org_deletes_or_hands_off() {
        let d = decide_membership(OrgRole::Owner, false, false, false);
        assert_eq!(d.required_action, RequiredAction::DeleteOrganization);
        assert!(!d.auto_deletable);
    }

    #[test]
    fn sole_owner_without_subscription_but_with_admin_transfers() {
        let d = decide_membership(OrgRole::Owner, false, true, false);
        assert_eq!(d.required_action, RequiredAction::TransferOwnership);
        assert!(!d.auto_deletable);
    }

    // ==================== SERIALIZATION ====================

    #[test]
    fn required_action_serializes_snake_case() {
        let json = serde_json::to_value(RequiredAction::CancelSubscription).unwrap();
        assert_eq!(json, "cancel_subscription");
    }

    #[test]
    fn blocker_messages_prefer_the_org_name() {
        let msg = blocker_message(RequiredAction::TransferOwnership, Some("Acme"), "org_1");
        assert!(msg.contains("Acme"));
        let msg = blocker_message(RequiredAction::TransferOwnership, None, "org_1");
        assert!(msg.contains("org_1"));
    }
}
