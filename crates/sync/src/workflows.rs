//! Sync workflow execution.
//!
//! A workflow is one attempt series at applying a webhook payload to the
//! mirror tables. Workflows run as detached tasks so the webhook response
//! never waits on them; transient failures retry in-process with jittered
//! exponential backoff, and terminal failures land in the dead letter
//! queue. Whatever happens, the workflow's sync record is driven to a
//! terminal status exactly once.

use std::time::Instant;

use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::dead_letter::DeadLetterStore;
use crate::entities::EntityStore;
use crate::error::SyncError;
use crate::events::EntityType;
use crate::records::SyncRecordStore;

/// In-process retry attempts after the first failure.
const MAX_RETRIES: usize = 3;

/// Multiplier applied to the doubling series: 250ms, 500ms, 1s, jittered.
const BACKOFF_FACTOR_MS: u64 = 125;

/// Everything a workflow needs to run, including enough to be replayed
/// later from a dead letter item.
#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub webhook_event: String,
    pub payload: serde_json::Value,
    /// Set when this run is a dead letter retry; links the outcome back
    /// to the item so success resolves it.
    pub dead_letter_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct WorkflowRunner {
    records: SyncRecordStore,
    dead_letters: DeadLetterStore,
    entities: EntityStore,
}

impl WorkflowRunner {
    pub fn new(records: SyncRecordStore, dead_letters: DeadLetterStore, entities: EntityStore) -> Self {
        Self {
            records,
            dead_letters,
            entities,
        }
    }

    /// Spawn a workflow as a detached task. The caller keeps only the
    /// workflow id; progress is observable through the sync record.
    pub fn dispatch(&self, workflow_id: Uuid, job: SyncJob) {
        let runner = self.clone();
        tokio::spawn(async move {
            runner.run(workflow_id, job).await;
        });
    }

    /// Run a workflow to completion. Returns whether it succeeded.
    pub async fn run(&self, workflow_id: Uuid, job: SyncJob) -> bool {
        let started = Instant::now();

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(BACKOFF_FACTOR_MS)
            .map(jitter)
            .take(MAX_RETRIES);

        let result = RetryIf::spawn(
            strategy,
            || self.entities.apply(&job),
            |e: &SyncError| e.is_retryable(),
        )
        .await;

        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                if let Err(e) = self.records.mark_success(workflow_id, duration_ms).await {
                    tracing::error!(
                        workflow_id = %workflow_id,
                        error = %e,
                        "Workflow succeeded but its sync record could not be updated"
                    );
                }

                if let Some(item_id) = job.dead_letter_id {
                    match self.dead_letters.resolve_after_retry(item_id, workflow_id).await {
                        Ok(true) => {
                            tracing::info!(
                                dead_letter_id = %item_id,
                                workflow_id = %workflow_id,
                                "Dead letter item resolved by successful retry"
                            );
                        }
                        Ok(false) => {
                            tracing::debug!(
                                dead_letter_id = %item_id,
                                "Dead letter item was already resolved or superseded"
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                dead_letter_id = %item_id,
                                error = %e,
                                "Failed to resolve dead letter item after successful retry"
                            );
                        }
                    }
                }

                tracing::info!(
                    workflow_id = %workflow_id,
                    entity_type = %job.entity_type,
                    entity_id = %job.entity_id,
                    event = %job.webhook_event,
                    duration_ms,
                    "Sync workflow completed"
                );
                true
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let error_text = e.to_string();

                if let Err(mark_err) = self
                    .records
                    .mark_failed(workflow_id, &error_text, duration_ms)
                    .await
                {
                    tracing::error!(
                        workflow_id = %workflow_id,
                        error = %mark_err,
                        "Workflow failed and its sync record could not be updated"
                    );
                }

                if let Err(dl_err) = self
                    .dead_letters
                    .record_failure(
                        job.entity_type.as_str(),
                        &job.entity_id,
                        &job.webhook_event,
                        workflow_id,
                        Some(&job.payload),
                        &error_text,
                        retryable,
                    )
                    .await
                {
                    tracing::error!(
                        workflow_id = %workflow_id,
                        error = %dl_err,
                        "Failed to dead-letter a failed workflow"
                    );
                }

                tracing::warn!(
                    workflow_id = %workflow_id,
                    entity_type = %job.entity_type,
                    entity_id = %job.entity_id,
                    event = %job.webhook_event,
                    retryable,
                    error = %error_text,
                    "Sync workflow failed"
                );
                false
            }
        }
    }
}
