// Sync crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // SyncError::DeletionBlocked carries the full eligibility report
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Certiva Sync Module
//!
//! Keeps the local mirror of identity provider state (users,
//! organizations, memberships, domains) consistent via webhooks, and
//! owns everything downstream of a sync failure.
//!
//! ## Features
//!
//! - **Webhook Receiving**: Signature verification and exactly-once claims
//! - **Sync Workflows**: Detached per-event workflows with bounded retry
//! - **Sync Records**: Durable per-workflow audit trail for the dashboard
//! - **Dead Letter Queue**: Failed syncs held for retry or manual resolution
//! - **Account Deletion**: Eligibility checks and provider-side deletion
//! - **Invariants**: Runnable consistency checks over the whole pipeline

pub mod dead_letter;
pub mod deletion;
pub mod entities;
pub mod error;
pub mod events;
pub mod identity;
pub mod invariants;
pub mod records;
pub mod webhooks;
pub mod workflows;

#[cfg(test)]
mod edge_case_tests;

// Dead letter queue
pub use dead_letter::{
    BulkRetryReport, DeadLetterItem, DeadLetterService, DeadLetterStore, RetryReceipt,
};

// Deletion
pub use deletion::{
    decide_membership, DeletionCheck, DeletionChecker, DeletionResult, MembershipDecision,
    OrgDeletionStatus, RequiredAction,
};

// Entities
pub use entities::EntityStore;

// Error
pub use error::{SyncError, SyncResult};

// Events
pub use events::{EntityType, EventEnvelope, IdentityEventKind};

// Identity provider client
pub use identity::IdentityClient;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Records
pub use records::{
    RecordFilter, SweepReport, SyncRecord, SyncRecordStore, SyncStats, SyncStatus,
};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookHeaders, WebhookReceipt, WebhookVerifier};

// Workflows
pub use workflows::{SyncJob, WorkflowRunner};

use sqlx::PgPool;

/// Main sync service that combines all sync functionality
pub struct SyncService {
    pub records: SyncRecordStore,
    pub dead_letters: DeadLetterService,
    pub webhooks: WebhookHandler,
    pub deletion: DeletionChecker,
    pub invariants: InvariantChecker,
}

impl SyncService {
    /// Create a new sync service from environment variables
    /// (`CLERK_WEBHOOK_SECRET`, `CLERK_SECRET_KEY`, `CLERK_API_BASE`).
    pub fn from_env(pool: PgPool) -> SyncResult<Self> {
        let webhook_secret = std::env::var("CLERK_WEBHOOK_SECRET")
            .map_err(|_| SyncError::Internal("CLERK_WEBHOOK_SECRET must be set".to_string()))?;
        Ok(Self::new(pool, &webhook_secret, IdentityClient::from_env()))
    }

    /// Create a new sync service with explicit config
    pub fn new(pool: PgPool, webhook_secret: &str, identity: Option<IdentityClient>) -> Self {
        let records = SyncRecordStore::new(pool.clone());
        let dead_letter_store = DeadLetterStore::new(pool.clone());
        let entities = EntityStore::new(pool.clone());
        let runner = WorkflowRunner::new(
            records.clone(),
            dead_letter_store.clone(),
            entities,
        );

        Self {
            records: records.clone(),
            dead_letters: DeadLetterService::new(dead_letter_store, records.clone(), runner.clone()),
            webhooks: WebhookHandler::new(
                pool.clone(),
                WebhookVerifier::new(webhook_secret),
                records,
                runner,
            ),
            deletion: DeletionChecker::new(pool.clone(), identity),
            invariants: InvariantChecker::new(pool),
        }
    }
}
