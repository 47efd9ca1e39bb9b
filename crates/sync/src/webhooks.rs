//! Identity webhook receiving.
//!
//! Verifies provider (Svix-scheme) signatures, claims each delivery for
//! exactly-once processing, creates the sync record, and spawns the sync
//! workflow. The HTTP layer above this maps [`WebhookReceipt`] and
//! [`SyncError`] variants onto response codes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::events::{entity_ref, EventEnvelope, IdentityEventKind};
use crate::records::SyncRecordStore;
use crate::workflows::{SyncJob, WorkflowRunner};

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed skew between the delivery timestamp header and our
/// clock, in seconds.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Re-claim deliveries stuck in `processing` after this long.
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// The three signature headers the provider sends with every delivery.
#[derive(Debug, Clone)]
pub struct WebhookHeaders {
    pub message_id: String,
    pub timestamp: String,
    pub signature: String,
}

/// Verifies provider webhook signatures.
///
/// The provider signs `{message_id}.{timestamp}.{body}` with HMAC-SHA256
/// under the base64-decoded portion of the `whsec_` secret, and sends one
/// or more space-separated `v1,<base64 signature>` candidates. Any
/// matching candidate passes.
#[derive(Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Self {
        let stripped = secret.strip_prefix("whsec_").unwrap_or(secret);
        let key = match BASE64.decode(stripped) {
            Ok(key) => key,
            Err(_) => {
                tracing::warn!(
                    "Webhook secret is not base64; using raw bytes as the signing key"
                );
                stripped.as_bytes().to_vec()
            }
        };
        Self { key }
    }

    pub fn verify(&self, headers: &WebhookHeaders, payload: &str) -> SyncResult<()> {
        self.verify_at(headers, payload, OffsetDateTime::now_utc().unix_timestamp())
    }

    fn verify_at(&self, headers: &WebhookHeaders, payload: &str, now: i64) -> SyncResult<()> {
        let timestamp: i64 = headers.timestamp.parse().map_err(|_| {
            tracing::warn!(timestamp = %headers.timestamp, "Non-numeric webhook timestamp header");
            SyncError::SignatureInvalid
        })?;

        if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                timestamp,
                now,
                skew = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(SyncError::SignatureInvalid);
        }

        let expected = self.sign(&headers.message_id, &headers.timestamp, payload)?;

        for candidate in headers.signature.split_whitespace() {
            if let Some(signature) = candidate.strip_prefix("v1,") {
                if signature == expected {
                    return Ok(());
                }
            }
        }

        tracing::warn!(
            message_id = %headers.message_id,
            "No webhook signature candidate matched"
        );
        Err(SyncError::SignatureInvalid)
    }

    /// Compute the v1 signature for a message. Exposed for tests and for
    /// the local delivery simulator.
    pub fn sign(&self, message_id: &str, timestamp: &str, payload: &str) -> SyncResult<String> {
        let signed_content = format!("{message_id}.{timestamp}.{payload}");
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| SyncError::Internal("webhook signing key is empty".to_string()))?;
        mac.update(signed_content.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

/// What became of an accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReceipt {
    /// A sync workflow was spawned for the event.
    Dispatched { workflow_id: Uuid },
    /// Another delivery of the same message already claimed processing.
    Duplicate,
    /// Verified fine but not an event type we sync.
    Ignored { event_type: String },
}

/// Receives verified identity events and turns them into sync workflows.
pub struct WebhookHandler {
    pool: PgPool,
    verifier: WebhookVerifier,
    records: SyncRecordStore,
    runner: WorkflowRunner,
}

impl WebhookHandler {
    pub fn new(
        pool: PgPool,
        verifier: WebhookVerifier,
        records: SyncRecordStore,
        runner: WorkflowRunner,
    ) -> Self {
        Self {
            pool,
            verifier,
            records,
            runner,
        }
    }

    /// Verify, claim, and dispatch one delivery.
    pub async fn receive(&self, headers: &WebhookHeaders, payload: &str) -> SyncResult<WebhookReceipt> {
        self.verifier.verify(headers, payload)?;

        let envelope: EventEnvelope = serde_json::from_str(payload)
            .map_err(|e| SyncError::Payload(format!("unparseable webhook envelope: {e}")))?;

        self.handle_event(headers, envelope).await
    }

    /// Handle a verified event.
    ///
    /// Uses INSERT...ON CONFLICT...RETURNING to atomically claim exclusive
    /// processing rights for the message id, so concurrent redeliveries
    /// cannot both dispatch. Deliveries stuck in `processing` past the
    /// timeout are re-claimable.
    pub async fn handle_event(
        &self,
        headers: &WebhookHeaders,
        envelope: EventEnvelope,
    ) -> SyncResult<WebhookReceipt> {
        let message_id = headers.message_id.as_str();
        let event_type = envelope.event_type.clone();

        let event_timestamp = headers
            .timestamp
            .parse::<i64>()
            .ok()
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO identity_webhook_events
                (svix_message_id, event_type, payload, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (svix_message_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE identity_webhook_events.processing_result = 'processing'
              AND identity_webhook_events.processing_started_at < NOW() - ($5 * INTERVAL '1 minute')
            RETURNING id
            "#,
        )
        .bind(message_id)
        .bind(&event_type)
        .bind(&envelope.data)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                message_id = %message_id,
                error = %e,
                "Failed to claim webhook delivery for processing"
            );
            SyncError::Database(e)
        })?;

        if claimed.is_none() {
            let existing_status: Option<(String,)> = sqlx::query_as(
                "SELECT processing_result FROM identity_webhook_events WHERE svix_message_id = $1",
            )
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

            let reason = match existing_status {
                Some((status,)) if status == "success" => "already processed successfully",
                Some((status,)) if status == "processing" => {
                    "currently being processed by another worker"
                }
                Some(_) => "exists with another status",
                None => "unknown (race condition?)",
            };

            tracing::info!(
                message_id = %message_id,
                event_type = %event_type,
                reason = %reason,
                "Duplicate webhook delivery - atomic idempotency check"
            );
            return Ok(WebhookReceipt::Duplicate);
        }

        tracing::info!(
            message_id = %message_id,
            event_type = %event_type,
            "Processing identity webhook event (claimed exclusive processing rights)"
        );

        let outcome = self.dispatch_claimed(message_id, &event_type, envelope.data).await;

        let (processing_result, error_message) = match &outcome {
            Ok(_) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        self.update_claim(message_id, &processing_result, error_message.as_deref())
            .await;

        outcome
    }

    async fn dispatch_claimed(
        &self,
        message_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> SyncResult<WebhookReceipt> {
        let Some(kind) = IdentityEventKind::parse(event_type) else {
            tracing::info!(event_type = %event_type, "Unhandled identity event type");
            return Ok(WebhookReceipt::Ignored {
                event_type: event_type.to_string(),
            });
        };

        let (entity_type, entity_id) = entity_ref(kind, &data)?;
        let workflow_id = Uuid::new_v4();

        self.records
            .create_pending(entity_type, &entity_id, event_type, workflow_id, Some(message_id))
            .await?;

        self.runner.dispatch(
            workflow_id,
            SyncJob {
                entity_type,
                entity_id,
                webhook_event: event_type.to_string(),
                payload: data,
                dead_letter_id: None,
            },
        );

        Ok(WebhookReceipt::Dispatched { workflow_id })
    }

    /// Update the claim row with the dispatch outcome. Retried once; the
    /// row is the idempotency lock, so losing the update risks a stuck
    /// `processing` state until the timeout expires.
    async fn update_claim(&self, message_id: &str, result: &str, error_message: Option<&str>) {
        let update = sqlx::query(
            r#"
            UPDATE identity_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE svix_message_id = $3
            "#,
        )
        .bind(result)
        .bind(error_message)
        .bind(message_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = update {
            tracing::warn!(
                message_id = %message_id,
                error = %e,
                "First attempt to update webhook claim failed, retrying..."
            );

            if let Err(retry_err) = sqlx::query(
                r#"
                UPDATE identity_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE svix_message_id = $3
                "#,
            )
            .bind(result)
            .bind(error_message)
            .bind(message_id)
            .execute(&self.pool)
            .await
            {
                tracing::error!(
                    message_id = %message_id,
                    processing_result = %result,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to update webhook claim after retry. Delivery may appear \
                     stuck in 'processing' until the recovery timeout expires."
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> WebhookVerifier {
        // "dGVzdC1zaWduaW5nLWtleQ==" is base64 for "test-signing-key"
        WebhookVerifier::new("whsec_dGVzdC1zaWduaW5nLWtleQ==")
    }

    fn signed_headers(v: &WebhookVerifier, message_id: &str, timestamp: i64, payload: &str) -> WebhookHeaders {
        let ts = timestamp.to_string();
        let signature = format!("v1,{}", v.sign(message_id, &ts, payload).unwrap());
        WebhookHeaders {
            message_id: message_id.to_string(),
            timestamp: ts,
            signature,
        }
    }

    // ==================== SIGNATURE VERIFICATION ====================

    #[test]
    fn accepts_a_correctly_signed_delivery() {
        let v = verifier();
        let payload = r#"{"type":"user.created","data":{"id":"user_1"}}"#;
        let headers = signed_headers(&v, "msg_1", 1_700_000_000, payload);
        assert!(v.verify_at(&headers, payload, 1_700_000_000).is_ok());
    }

    #[test]
    fn accepts_any_matching_candidate_in_a_multi_signature_header() {
        let v = verifier();
        let payload = r#"{"type":"user.created","data":{"id":"user_1"}}"#;
        let mut headers = signed_headers(&v, "msg_1", 1_700_000_000, payload);
        headers.signature = format!("v1,bm90LXRoaXMtb25l {}", headers.signature);
        assert!(v.verify_at(&headers, payload, 1_700_000_000).is_ok());
    }

    #[test]
    fn rejects_a_tampered_body() {
        let v = verifier();
        let headers = signed_headers(&v, "msg_1", 1_700_000_000, r#"{"a":1}"#);
        let err = v.verify_at(&headers, r#"{"a":2}"#, 1_700_000_000).unwrap_err();
        assert!(matches!(err, SyncError::SignatureInvalid));
    }

    #[test]
    fn rejects_a_signature_for_a_different_message_id() {
        let v = verifier();
        let payload = r#"{"a":1}"#;
        let mut headers = signed_headers(&v, "msg_1", 1_700_000_000, payload);
        headers.message_id = "msg_2".to_string();
        assert!(v.verify_at(&headers, payload, 1_700_000_000).is_err());
    }

    #[test]
    fn rejects_timestamps_outside_tolerance() {
        let v = verifier();
        let payload = r#"{"a":1}"#;
        let headers = signed_headers(&v, "msg_1", 1_700_000_000, payload);

        // 300s is the limit; 301s past in either direction fails
        assert!(v.verify_at(&headers, payload, 1_700_000_000 + 301).is_err());
        assert!(v.verify_at(&headers, payload, 1_700_000_000 - 301).is_err());
        // Exactly at the edge still passes
        assert!(v.verify_at(&headers, payload, 1_700_000_000 + 300).is_ok());
    }

    #[test]
    fn rejects_non_numeric_timestamp_headers() {
        let v = verifier();
        let headers = WebhookHeaders {
            message_id: "msg_1".into(),
            timestamp: "yesterday".into(),
            signature: "v1,irrelevant".into(),
        };
        assert!(matches!(
            v.verify_at(&headers, "{}", 0).unwrap_err(),
            SyncError::SignatureInvalid
        ));
    }

    #[test]
    fn rejects_candidates_with_unknown_version_prefixes() {
        let v = verifier();
        let payload = r#"{"a":1}"#;
        let ts = "1700000000";
        let raw = v.sign("msg_1", ts, payload).unwrap();
        let headers = WebhookHeaders {
            message_id: "msg_1".into(),
            timestamp: ts.into(),
            // Correct signature bytes under the wrong version tag
            signature: format!("v2,{raw}"),
        };
        assert!(v.verify_at(&headers, payload, 1_700_000_000).is_err());
    }

    #[test]
    fn non_base64_secret_falls_back_to_raw_bytes() {
        let v = WebhookVerifier::new("whsec_!!not-base64!!");
        let payload = "{}";
        let headers = signed_headers(&v, "msg_1", 1_700_000_000, payload);
        assert!(v.verify_at(&headers, payload, 1_700_000_000).is_ok());
    }
}
