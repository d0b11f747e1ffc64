//! Webhook ingestion
//!
//! The processor applies the same ordered checks to every provider's
//! webhook: structural validation (adapter), signature policy, payment
//! lookup, amount/currency/merchant cross-checks, staleness, idempotency
//! fingerprint, status mapping, then one atomic apply with exactly-once
//! side effects.

mod processor;

pub use processor::{apply_status_change, run_terminal_side_effects, WebhookProcessor};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Webhook rejection taxonomy. Consistency errors are rejected in every
/// environment; signature policy is environment-gated by the processor.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("malformed webhook payload: {0}")]
    InvalidPayload(String),

    #[error("webhook signature missing")]
    MissingSignature,

    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error("unknown gateway '{0}'")]
    UnknownGateway(String),

    #[error("no payment found for reference {reference:?} / provider tx {provider_tx_id:?}")]
    UnknownPayment {
        reference: Option<String>,
        provider_tx_id: Option<String>,
    },

    #[error("webhook amount {got} does not match payment amount {expected}")]
    AmountMismatch { expected: Decimal, got: Decimal },

    #[error("webhook currency {got} does not match payment currency {expected}")]
    CurrencyMismatch { expected: String, got: String },

    #[error("webhook merchant '{got}' does not match configured merchant '{expected}'")]
    MerchantMismatch { expected: String, got: String },

    #[error("webhook completion timestamp is {age_hours}h old, outside the replay window")]
    StaleEvent { age_hours: i64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WebhookError {
    /// Whether the provider, not this service, is at fault (4xx-equivalent).
    pub fn is_rejection(&self) -> bool {
        !matches!(self, WebhookError::Internal(_))
    }
}

/// Explicit ack returned for every webhook, including no-ops, so the
/// provider does not retry a successfully-processed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub success: bool,
    pub status: String,
    pub message: String,
}

impl WebhookAck {
    pub fn ok(status: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            status: status.to_string(),
            message: message.into(),
        }
    }
}

/// Content fingerprint used to detect duplicate deliveries. Hashes the
/// normalized tuple the provider cannot vary across re-sends of the same
/// event.
pub fn fingerprint(
    provider_tx_id: &str,
    provider_status: &str,
    amount: Decimal,
    completed_at: Option<DateTime<Utc>>,
) -> String {
    let ts = completed_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let normalized = format!(
        "{}|{}|{}|{}",
        provider_tx_id,
        provider_status.trim().to_ascii_lowercase(),
        amount.normalize(),
        ts
    );
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}
