//! Paystar adapter
//!
//! Hosted-checkout aggregator (cards, bank transfer, mobile money). The
//! wire API works in minor currency units and signs webhooks with
//! HMAC-SHA512 over the raw body, hex-encoded in `x-paystar-signature`.

use super::*;
use crate::models::{HandlingMode, PaymentStatus};
use crate::webhook::WebhookError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha512;
use tracing::debug;

type HmacSha512 = Hmac<Sha512>;

const DEFAULT_BASE_URL: &str = "https://api.paystar.example.com";

const STATUS_TABLE: &[(&str, PaymentStatus)] = &[
    ("success", PaymentStatus::Completed),
    ("failed", PaymentStatus::Failed),
    ("reversed", PaymentStatus::Failed),
    ("abandoned", PaymentStatus::Cancelled),
    ("pending", PaymentStatus::Pending),
    ("ongoing", PaymentStatus::Pending),
    ("processing", PaymentStatus::Pending),
    ("queued", PaymentStatus::Pending),
];

#[derive(Debug, Clone)]
pub struct PaystarCredentials {
    pub secret_key: String,
    pub merchant_id: String,
    pub base_url: String,
}

impl PaystarCredentials {
    pub fn from_env() -> Option<Self> {
        let secret_key = std::env::var("PAYSTAR_SECRET_KEY").ok()?;
        let merchant_id = std::env::var("PAYSTAR_MERCHANT_ID").ok()?;
        if secret_key.is_empty() || merchant_id.is_empty() {
            return None;
        }
        let base_url =
            std::env::var("PAYSTAR_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Some(Self {
            secret_key,
            merchant_id,
            base_url,
        })
    }
}

pub struct PaystarGateway {
    client: Client,
    credentials: PaystarCredentials,
}

#[derive(Debug, Deserialize)]
struct InitializeResponse {
    status: bool,
    message: Option<String>,
    data: Option<InitializeData>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    status: bool,
    message: Option<String>,
    data: Option<VerifyData>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    id: serde_json::Value,
    status: String,
}

impl PaystarGateway {
    pub fn new(client: Client, credentials: PaystarCredentials) -> Self {
        Self {
            client,
            credentials,
        }
    }

    pub fn from_env(client: Client) -> Option<Self> {
        PaystarCredentials::from_env().map(|credentials| Self::new(client, credentials))
    }

    fn verify_signature(&self, raw: &RawWebhook) -> SignatureState {
        let Some(signature) = raw.header("x-paystar-signature") else {
            return SignatureState::Missing;
        };
        let mut mac = match HmacSha512::new_from_slice(self.credentials.secret_key.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return SignatureState::Invalid,
        };
        mac.update(raw.body.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        if expected.eq_ignore_ascii_case(signature) {
            SignatureState::Verified
        } else {
            SignatureState::Invalid
        }
    }
}

#[async_trait]
impl PaymentGateway for PaystarGateway {
    fn id(&self) -> &'static str {
        "paystar"
    }

    fn supported_methods(&self) -> &'static [&'static str] {
        &["card", "bank_transfer", "mobile_money"]
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["NGN", "GHS", "KES", "ZAR"]
    }

    fn handling_mode(&self, _method: &str) -> HandlingMode {
        // Everything goes through the hosted payment page.
        HandlingMode::CheckoutUrl
    }

    fn merchant_id(&self) -> Option<&str> {
        Some(&self.credentials.merchant_id)
    }

    fn map_status(&self, provider_status: &str) -> PaymentStatus {
        reduce_status(self.id(), STATUS_TABLE, provider_status)
    }

    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse> {
        let amount_minor = major_to_minor(request.amount)?;
        let url = format!("{}/transaction/initialize", self.credentials.base_url);
        let body = serde_json::json!({
            "email": request.customer.email,
            "amount": amount_minor,
            "currency": request.currency,
            "reference": request.reference,
            "callback_url": request.callback_url,
            "channels": [request.payment_method],
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.credentials.secret_key)
            .json(&body)
            .send()
            .await
            .context("paystar initialize request failed")?;

        let http_status = resp.status();
        let parsed: InitializeResponse = resp
            .json()
            .await
            .context("paystar initialize response was not valid JSON")?;

        if !http_status.is_success() || !parsed.status {
            // Declined initializations are business failures, not errors.
            return Ok(PaymentResponse::failure(
                "failed",
                parsed
                    .message
                    .unwrap_or_else(|| format!("paystar rejected initialization ({})", http_status)),
            ));
        }

        let data = parsed
            .data
            .context("paystar initialize response missing data")?;
        debug!(reference = %data.reference, "paystar checkout session created");
        Ok(PaymentResponse {
            success: true,
            provider_tx_id: Some(data.reference),
            status: "pending".to_string(),
            redirect_url: Some(data.authorization_url),
            errors: Vec::new(),
        })
    }

    async fn check_payment_status(&self, provider_tx_id: &str) -> Result<StatusCheck> {
        let url = format!(
            "{}/transaction/verify/{}",
            self.credentials.base_url, provider_tx_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.credentials.secret_key)
            .send()
            .await
            .context("paystar verify request failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(StatusCheck::NotFound);
        }
        let parsed: VerifyResponse = resp
            .json()
            .await
            .context("paystar verify response was not valid JSON")?;

        if !parsed.status {
            let message = parsed.message.unwrap_or_default();
            if message.to_ascii_lowercase().contains("not found") {
                return Ok(StatusCheck::NotFound);
            }
            anyhow::bail!("paystar verify failed: {}", message);
        }

        let data = parsed.data.context("paystar verify response missing data")?;
        Ok(StatusCheck::Reported(ProviderPaymentState {
            provider_tx_id: Some(data.id.to_string()),
            provider_status: data.status,
            raw: None,
        }))
    }

    fn parse_webhook(&self, raw: &RawWebhook) -> Result<WebhookEvent, WebhookError> {
        let signature = self.verify_signature(raw);

        let payload: serde_json::Value = serde_json::from_str(&raw.body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        let data = payload
            .get("data")
            .ok_or(WebhookError::MissingField("data"))?;

        let provider_tx_id = data
            .get("id")
            .and_then(|v| {
                v.as_i64()
                    .map(|n| n.to_string())
                    .or_else(|| v.as_str().map(str::to_string))
            })
            .ok_or(WebhookError::MissingField("data.id"))?;
        let reference = data
            .get("reference")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let provider_status = data
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("data.status"))?
            .to_string();
        let amount_minor = data
            .get("amount")
            .and_then(|v| v.as_i64())
            .ok_or(WebhookError::MissingField("data.amount"))?;
        let currency = data
            .get("currency")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("data.currency"))?
            .to_string();
        let completed_at = data
            .get("paid_at")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let merchant_id = data
            .get("integration")
            .and_then(|v| {
                v.as_i64()
                    .map(|n| n.to_string())
                    .or_else(|| v.as_str().map(str::to_string))
            });

        Ok(WebhookEvent {
            provider_tx_id,
            reference,
            provider_status,
            amount: minor_to_major(amount_minor),
            currency,
            completed_at,
            merchant_id,
            signature,
            raw: payload,
        })
    }

    async fn initiate_transfer(&self, _request: &PayoutRequest) -> Result<PaymentResponse> {
        Ok(PaymentResponse::failure(
            "failed",
            "paystar has no disbursement rail",
        ))
    }
}
