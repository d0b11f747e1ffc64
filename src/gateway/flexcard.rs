//! Flexcard adapter
//!
//! Card gateway with hosted checkout sessions only. Minor-unit amounts.
//! Webhooks are signed with a timestamped HMAC-SHA256: the
//! `flexcard-signature` header carries `t=<unix>,v1=<hex>` where the digest
//! covers `"{t}.{body}"`.

use super::*;
use crate::models::{HandlingMode, PaymentStatus};
use crate::webhook::WebhookError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://api.flexcard.example.com/v1";

const STATUS_TABLE: &[(&str, PaymentStatus)] = &[
    ("succeeded", PaymentStatus::Completed),
    ("failed", PaymentStatus::Failed),
    ("canceled", PaymentStatus::Cancelled),
    ("expired", PaymentStatus::Cancelled),
    ("created", PaymentStatus::Pending),
    ("processing", PaymentStatus::Pending),
    ("requires_action", PaymentStatus::Pending),
];

#[derive(Debug, Clone)]
pub struct FlexcardCredentials {
    pub api_key: String,
    pub webhook_secret: String,
    pub base_url: String,
}

impl FlexcardCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("FLEXCARD_API_KEY").ok()?;
        let webhook_secret = std::env::var("FLEXCARD_WEBHOOK_SECRET").ok()?;
        if api_key.is_empty() || webhook_secret.is_empty() {
            return None;
        }
        let base_url =
            std::env::var("FLEXCARD_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Some(Self {
            api_key,
            webhook_secret,
            base_url,
        })
    }
}

pub struct FlexcardGateway {
    client: Client,
    credentials: FlexcardCredentials,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
    checkout_url: String,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    status: String,
}

impl FlexcardGateway {
    pub fn new(client: Client, credentials: FlexcardCredentials) -> Self {
        Self {
            client,
            credentials,
        }
    }

    pub fn from_env(client: Client) -> Option<Self> {
        FlexcardCredentials::from_env().map(|credentials| Self::new(client, credentials))
    }

    fn verify_signature(&self, raw: &RawWebhook) -> SignatureState {
        let Some(header) = raw.header("flexcard-signature") else {
            return SignatureState::Missing;
        };

        let mut timestamp = None;
        let mut provided = None;
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", v)) => timestamp = Some(v),
                Some(("v1", v)) => provided = Some(v),
                _ => {}
            }
        }
        let (Some(timestamp), Some(provided)) = (timestamp, provided) else {
            return SignatureState::Invalid;
        };

        let mut mac = match HmacSha256::new_from_slice(self.credentials.webhook_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return SignatureState::Invalid,
        };
        mac.update(format!("{}.{}", timestamp, raw.body).as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        if expected.eq_ignore_ascii_case(provided) {
            SignatureState::Verified
        } else {
            SignatureState::Invalid
        }
    }
}

#[async_trait]
impl PaymentGateway for FlexcardGateway {
    fn id(&self) -> &'static str {
        "flexcard"
    }

    fn supported_methods(&self) -> &'static [&'static str] {
        &["card"]
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["USD", "EUR", "GBP", "NGN"]
    }

    fn handling_mode(&self, _method: &str) -> HandlingMode {
        HandlingMode::CheckoutUrl
    }

    fn map_status(&self, provider_status: &str) -> PaymentStatus {
        reduce_status(self.id(), STATUS_TABLE, provider_status)
    }

    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse> {
        let amount_minor = major_to_minor(request.amount)?;
        let url = format!("{}/checkout/sessions", self.credentials.base_url);
        let body = serde_json::json!({
            "amount": amount_minor,
            "currency": request.currency.to_ascii_lowercase(),
            "reference": request.reference,
            "customer_email": request.customer.email,
            "success_url": request.callback_url,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.credentials.api_key)
            .json(&body)
            .send()
            .await
            .context("flexcard session request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail: serde_json::Value = resp.json().await.unwrap_or_default();
            let message = detail
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("checkout session rejected");
            return Ok(PaymentResponse::failure(
                "failed",
                format!("{} ({})", message, status),
            ));
        }

        let session: SessionResponse = resp
            .json()
            .await
            .context("flexcard session response was not valid JSON")?;

        Ok(PaymentResponse {
            success: true,
            provider_tx_id: Some(session.session_id),
            status: "pending".to_string(),
            redirect_url: Some(session.checkout_url),
            errors: Vec::new(),
        })
    }

    async fn check_payment_status(&self, provider_tx_id: &str) -> Result<StatusCheck> {
        let url = format!("{}/charges/{}", self.credentials.base_url, provider_tx_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.credentials.api_key)
            .send()
            .await
            .context("flexcard charge lookup failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(StatusCheck::NotFound);
        }
        let charge: ChargeResponse = resp
            .json()
            .await
            .context("flexcard charge response was not valid JSON")?;

        Ok(StatusCheck::Reported(ProviderPaymentState {
            provider_tx_id: Some(charge.id),
            provider_status: charge.status,
            raw: None,
        }))
    }

    fn parse_webhook(&self, raw: &RawWebhook) -> Result<WebhookEvent, WebhookError> {
        let signature = self.verify_signature(raw);

        let payload: serde_json::Value = serde_json::from_str(&raw.body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        let object = payload
            .get("data")
            .and_then(|d| d.get("object"))
            .ok_or(WebhookError::MissingField("data.object"))?;

        let provider_tx_id = object
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("data.object.id"))?
            .to_string();
        let reference = object
            .get("reference")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let provider_status = object
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("data.object.status"))?
            .to_string();
        let amount_minor = object
            .get("amount")
            .and_then(|v| v.as_i64())
            .ok_or(WebhookError::MissingField("data.object.amount"))?;
        let currency = object
            .get("currency")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("data.object.currency"))?
            .to_ascii_uppercase();
        let completed_at = payload
            .get("created")
            .and_then(|v| v.as_i64())
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));

        Ok(WebhookEvent {
            provider_tx_id,
            reference,
            provider_status,
            amount: minor_to_major(amount_minor),
            currency,
            completed_at,
            merchant_id: None,
            signature,
            raw: payload,
        })
    }

    async fn initiate_transfer(&self, _request: &PayoutRequest) -> Result<PaymentResponse> {
        Ok(PaymentResponse::failure(
            "failed",
            "flexcard has no disbursement rail",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn gateway() -> FlexcardGateway {
        FlexcardGateway::new(
            Client::new(),
            FlexcardCredentials {
                api_key: "fc_test_key".to_string(),
                webhook_secret: "whsec_test".to_string(),
                base_url: DEFAULT_BASE_URL.to_string(),
            },
        )
    }

    fn sample_body(created: i64) -> String {
        serde_json::json!({
            "type": "charge.succeeded",
            "created": created,
            "data": { "object": {
                "id": "ch_123",
                "reference": "TIP-ref-9",
                "status": "succeeded",
                "amount": 2599,
                "currency": "usd"
            }}
        })
        .to_string()
    }

    fn signature_header(secret: &str, timestamp: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn parses_timestamped_signature() {
        let gw = gateway();
        let body = sample_body(1_766_000_000);
        let header = signature_header("whsec_test", 1_766_000_000, &body);
        let raw = RawWebhook::new(body, vec![("Flexcard-Signature".to_string(), header)]);

        let event = gw.parse_webhook(&raw).unwrap();
        assert_eq!(event.signature, SignatureState::Verified);
        assert_eq!(event.amount, dec!(25.99));
        assert_eq!(event.currency, "USD");
        assert!(event.completed_at.is_some());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let gw = gateway();
        let body = sample_body(1_766_000_000);
        let header = signature_header("whsec_test", 1_766_000_000, &body);
        let tampered = body.replace("2599", "99");
        let raw = RawWebhook::new(tampered, vec![("flexcard-signature".to_string(), header)]);
        let event = gw.parse_webhook(&raw).unwrap();
        assert_eq!(event.signature, SignatureState::Invalid);
    }

    #[test]
    fn expired_sessions_map_to_cancelled() {
        let gw = gateway();
        assert_eq!(gw.map_status("expired"), PaymentStatus::Cancelled);
        assert_eq!(gw.map_status("requires_action"), PaymentStatus::Pending);
    }
}
