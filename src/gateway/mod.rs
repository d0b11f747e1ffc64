//! Payment gateway abstraction
//!
//! One adapter per external provider. Adapters translate the
//! provider-neutral request/status/webhook shapes below into provider wire
//! calls and back; provider-specific payloads never leak past this module.
//! Business failures come back as `success = false` with an error list, an
//! `Err` is reserved for configuration and transport problems.

pub mod flexcard;
pub mod mobipay;
pub mod paystar;
pub mod registry;

use crate::models::{HandlingMode, PaymentStatus};
use crate::webhook::WebhookError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
}

/// Provider-neutral collection request. Amounts are major-unit decimal;
/// adapters working in minor units convert at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub customer: CustomerInfo,
    /// Where a hosted checkout should land the buyer afterwards.
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub success: bool,
    pub provider_tx_id: Option<String>,
    pub status: String,
    pub redirect_url: Option<String>,
    pub errors: Vec<String>,
}

impl PaymentResponse {
    pub fn failure(status: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_tx_id: None,
            status: status.to_string(),
            redirect_url: None,
            errors: vec![error.into()],
        }
    }
}

/// Outbound transfer (tipster payout or buyer refund).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub account_number: String,
    pub account_name: String,
    pub bank_code: String,
    pub narration: String,
}

/// Result of a synchronous status pull. "Not found" is a distinct,
/// non-fatal outcome.
#[derive(Debug, Clone)]
pub enum StatusCheck {
    Reported(ProviderPaymentState),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct ProviderPaymentState {
    pub provider_tx_id: Option<String>,
    pub provider_status: String,
    pub raw: Option<serde_json::Value>,
}

/// Raw inbound webhook as delivered by the HTTP layer. Header names are
/// lowercased at construction.
#[derive(Debug, Clone)]
pub struct RawWebhook {
    pub body: String,
    headers: HashMap<String, String>,
}

impl RawWebhook {
    pub fn new(body: String, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            body,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

/// Outcome of an adapter's signature check. The processor applies the
/// environment policy; adapters only report what they saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureState {
    Verified,
    /// A verification key is configured but the webhook carried no signature.
    Missing,
    /// The signature was present but did not verify.
    Invalid,
    /// No verification key is configured for this adapter.
    NoKeyConfigured,
}

/// Provider webhook normalized to the shape the processor validates.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub provider_tx_id: String,
    pub reference: Option<String>,
    pub provider_status: String,
    /// Major-unit amount as declared by the provider.
    pub amount: Decimal,
    pub currency: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub merchant_id: Option<String>,
    pub signature: SignatureState,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn id(&self) -> &'static str;

    fn supported_methods(&self) -> &'static [&'static str];

    fn supported_currencies(&self) -> &'static [&'static str];

    fn handling_mode(&self, method: &str) -> HandlingMode;

    /// The merchant/application id the provider echoes back in webhooks,
    /// if this provider has such a concept.
    fn merchant_id(&self) -> Option<&str> {
        None
    }

    /// Reduce a provider status string to the closed local vocabulary.
    /// Unrecognized input maps to `Pending` with a logged warning, never
    /// silently to a terminal state.
    fn map_status(&self, provider_status: &str) -> PaymentStatus;

    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse>;

    async fn check_payment_status(&self, provider_tx_id: &str) -> Result<StatusCheck>;

    /// Parse and structurally validate a raw webhook, verifying its
    /// signature. Signature problems are reported in the event, not as Err.
    fn parse_webhook(&self, raw: &RawWebhook) -> Result<WebhookEvent, WebhookError>;

    /// Initiate an outbound bank / mobile-money transfer. Providers without
    /// a disbursement rail report a business failure.
    async fn initiate_transfer(&self, request: &PayoutRequest) -> Result<PaymentResponse>;
}

/// Shared exhaustive-mapping helper for adapter status tables.
pub(crate) fn reduce_status(
    gateway: &str,
    table: &[(&str, PaymentStatus)],
    provider_status: &str,
) -> PaymentStatus {
    let needle = provider_status.trim();
    for (provider, local) in table {
        if provider.eq_ignore_ascii_case(needle) {
            return *local;
        }
    }
    warn!(
        gateway,
        provider_status, "unrecognized provider status, treating as pending"
    );
    PaymentStatus::Pending
}

/// Minor-unit (cents) conversion at the adapter boundary.
pub(crate) fn minor_to_major(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

pub(crate) fn major_to_minor(amount: Decimal) -> Result<i64> {
    let scaled = amount * Decimal::new(100, 0);
    if scaled.fract() != Decimal::ZERO {
        anyhow::bail!("amount {} does not convert to whole minor units", amount);
    }
    scaled
        .trunc()
        .try_into()
        .map_err(|_| anyhow::anyhow!("amount {} overflows minor units", amount))
}
