//! Entity writers for the identity mirror tables.
//!
//! Every operation is an idempotent upsert or delete keyed on provider
//! ids, so webhook redelivery and out-of-order processing converge on the
//! same final state. Provider-managed profile fields are overwritten;
//! locally-managed fields (`platform_role`, `stripe_customer_id`) are
//! never touched from here.

use certiva_shared::OrgRole;
use sqlx::PgPool;

use crate::error::{SyncError, SyncResult};
use crate::events::{
    parse_payload, DeletedPayload, DomainPayload, IdentityEventKind, MembershipPayload,
    OrganizationPayload, UserPayload,
};
use crate::workflows::SyncJob;

#[derive(Clone)]
pub struct EntityStore {
    pool: PgPool,
}

impl EntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply one webhook event's payload to the mirror tables.
    pub async fn apply(&self, job: &SyncJob) -> SyncResult<()> {
        let kind = IdentityEventKind::parse(&job.webhook_event)
            .ok_or_else(|| SyncError::UnsupportedEvent(job.webhook_event.clone()))?;

        match kind {
            IdentityEventKind::UserCreated | IdentityEventKind::UserUpdated => {
                let user: UserPayload = parse_payload(&job.payload)?;
                self.upsert_user(&user).await
            }
            IdentityEventKind::UserDeleted => {
                let deleted: DeletedPayload = parse_payload(&job.payload)?;
                self.delete_user(&deleted.id).await
            }
            IdentityEventKind::OrganizationCreated | IdentityEventKind::OrganizationUpdated => {
                let org: OrganizationPayload = parse_payload(&job.payload)?;
                self.upsert_organization(&org).await
            }
            IdentityEventKind::OrganizationDeleted => {
                let deleted: DeletedPayload = parse_payload(&job.payload)?;
                self.delete_organization(&deleted.id).await
            }
            IdentityEventKind::MembershipCreated | IdentityEventKind::MembershipUpdated => {
                let membership: MembershipPayload = parse_payload(&job.payload)?;
                self.upsert_membership(&membership).await
            }
            IdentityEventKind::MembershipDeleted => {
                let membership: MembershipPayload = parse_payload(&job.payload)?;
                self.delete_membership(&membership).await
            }
            IdentityEventKind::DomainCreated | IdentityEventKind::DomainUpdated => {
                let domain: DomainPayload = parse_payload(&job.payload)?;
                self.upsert_domain(&domain).await
            }
            IdentityEventKind::DomainDeleted => {
                let domain: DomainPayload = parse_payload(&job.payload)?;
                self.delete_domain(&domain).await
            }
        }
    }

    async fn upsert_user(&self, user: &UserPayload) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (external_id, email, first_name, last_name, image_url)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO UPDATE SET
                email = EXCLUDED.email,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                image_url = EXCLUDED.image_url,
                updated_at = NOW()
            "#,
        )
        .bind(&user.id)
        .bind(user.primary_email())
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.image_url)
        .execute(&self.pool)
        .await?;

        tracing::debug!(user_id = %user.id, "User upserted from webhook");
        Ok(())
    }

    /// Remove a user and their memberships in one transaction. Missing
    /// rows are fine: the delete may race a delivery we never received.
    async fn delete_user(&self, external_id: &str) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM organization_memberships WHERE user_external_id = $1")
            .bind(external_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM users WHERE external_id = $1")
            .bind(external_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %external_id,
            existed = result.rows_affected() > 0,
            "User removed from mirror"
        );
        Ok(())
    }

    async fn upsert_organization(&self, org: &OrganizationPayload) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (external_id, name, slug, image_url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (external_id) DO UPDATE SET
                name = EXCLUDED.name,
                slug = EXCLUDED.slug,
                image_url = EXCLUDED.image_url,
                updated_at = NOW()
            "#,
        )
        .bind(&org.id)
        .bind(org.name.as_deref().unwrap_or("(unnamed)"))
        .bind(&org.slug)
        .bind(&org.image_url)
        .execute(&self.pool)
        .await?;

        tracing::debug!(org_id = %org.id, "Organization upserted from webhook");
        Ok(())
    }

    /// Remove an organization with its memberships and domains.
    /// Subscription rows survive for billing history; the Stripe side is
    /// closed out by its own webhook flow.
    async fn delete_organization(&self, external_id: &str) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM organization_memberships WHERE org_external_id = $1")
            .bind(external_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM organization_domains WHERE org_external_id = $1")
            .bind(external_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM organizations WHERE external_id = $1")
            .bind(external_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            org_id = %external_id,
            existed = result.rows_affected() > 0,
            "Organization removed from mirror"
        );
        Ok(())
    }

    async fn upsert_membership(&self, membership: &MembershipPayload) -> SyncResult<()> {
        let role = match OrgRole::parse(&membership.role) {
            Some(role) => role,
            None => {
                tracing::warn!(
                    org_id = %membership.organization.id,
                    user_id = %membership.public_user_data.user_id,
                    raw_role = %membership.role,
                    "Unrecognized membership role, storing as member"
                );
                OrgRole::Member
            }
        };

        sqlx::query(
            r#"
            INSERT INTO organization_memberships (org_external_id, user_external_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (org_external_id, user_external_id) DO UPDATE SET
                role = EXCLUDED.role,
                updated_at = NOW()
            "#,
        )
        .bind(&membership.organization.id)
        .bind(&membership.public_user_data.user_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            org_id = %membership.organization.id,
            user_id = %membership.public_user_data.user_id,
            role = %role,
            "Membership upserted from webhook"
        );
        Ok(())
    }

    async fn delete_membership(&self, membership: &MembershipPayload) -> SyncResult<()> {
        sqlx::query(
            "DELETE FROM organization_memberships WHERE org_external_id = $1 AND user_external_id = $2",
        )
        .bind(&membership.organization.id)
        .bind(&membership.public_user_data.user_id)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            org_id = %membership.organization.id,
            user_id = %membership.public_user_data.user_id,
            "Membership removed from mirror"
        );
        Ok(())
    }

    async fn upsert_domain(&self, domain: &DomainPayload) -> SyncResult<()> {
        let org_id = domain
            .organization_id
            .as_deref()
            .ok_or_else(|| SyncError::Payload("domain payload missing organization_id".into()))?;
        let verification_status = domain
            .verification
            .as_ref()
            .map(|v| v.status.as_str())
            .unwrap_or("unverified");

        sqlx::query(
            r#"
            INSERT INTO organization_domains (org_external_id, domain, enrollment_mode, verification_status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (org_external_id, domain) DO UPDATE SET
                enrollment_mode = EXCLUDED.enrollment_mode,
                verification_status = EXCLUDED.verification_status,
                updated_at = NOW()
            "#,
        )
        .bind(org_id)
        .bind(&domain.name)
        .bind(&domain.enrollment_mode)
        .bind(verification_status)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            org_id = %org_id,
            domain = %domain.name,
            status = %verification_status,
            "Domain upserted from webhook"
        );
        Ok(())
    }

    async fn delete_domain(&self, domain: &DomainPayload) -> SyncResult<()> {
        let org_id = domain
            .organization_id
            .as_deref()
            .ok_or_else(|| SyncError::Payload("domain payload missing organization_id".into()))?;

        sqlx::query(
            "DELETE FROM organization_domains WHERE org_external_id = $1 AND domain = $2",
        )
        .bind(org_id)
        .bind(&domain.name)
        .execute(&self.pool)
        .await?;

        tracing::debug!(org_id = %org_id, domain = %domain.name, "Domain removed from mirror");
        Ok(())
    }
}
