//! Mobipay adapter
//!
//! Direct mobile-money provider (STK-push collections plus a B2C
//! disbursement rail used for tipster payouts and buyer refunds). The wire
//! API works in major units; webhooks carry an HMAC-SHA256 signature,
//! base64-encoded in `x-mobipay-signature`, over the raw body.

use super::*;
use crate::models::{HandlingMode, PaymentStatus};
use crate::webhook::WebhookError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://api.mobipay.example.com/v2";

const STATUS_TABLE: &[(&str, PaymentStatus)] = &[
    ("SUCCESS", PaymentStatus::Completed),
    ("COMPLETED", PaymentStatus::Completed),
    ("FAILED", PaymentStatus::Failed),
    ("TIMEOUT", PaymentStatus::Failed),
    ("INSUFFICIENT_FUNDS", PaymentStatus::Failed),
    ("CANCELLED", PaymentStatus::Cancelled),
    ("USER_CANCELLED", PaymentStatus::Cancelled),
    ("PENDING", PaymentStatus::Pending),
    ("PROCESSING", PaymentStatus::Pending),
    ("AWAITING_USER", PaymentStatus::Pending),
];

#[derive(Debug, Clone)]
pub struct MobipayCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub merchant_code: String,
    pub base_url: String,
}

impl MobipayCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("MOBIPAY_API_KEY").ok()?;
        let api_secret = std::env::var("MOBIPAY_API_SECRET").ok()?;
        let merchant_code = std::env::var("MOBIPAY_MERCHANT_CODE").ok()?;
        if api_key.is_empty() || api_secret.is_empty() || merchant_code.is_empty() {
            return None;
        }
        let base_url =
            std::env::var("MOBIPAY_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Some(Self {
            api_key,
            api_secret,
            merchant_code,
            base_url,
        })
    }
}

pub struct MobipayGateway {
    client: Client,
    credentials: MobipayCredentials,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    result_code: String,
    result_desc: Option<String>,
    transaction_id: Option<String>,
    status: Option<String>,
}

impl MobipayGateway {
    pub fn new(client: Client, credentials: MobipayCredentials) -> Self {
        Self {
            client,
            credentials,
        }
    }

    pub fn from_env(client: Client) -> Option<Self> {
        MobipayCredentials::from_env().map(|credentials| Self::new(client, credentials))
    }

    fn sign_request(&self, canonical: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(canonical.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn verify_signature(&self, raw: &RawWebhook) -> SignatureState {
        let Some(signature) = raw.header("x-mobipay-signature") else {
            return SignatureState::Missing;
        };
        match self.sign_request(&raw.body) {
            Ok(expected) if expected == signature => SignatureState::Verified,
            _ => SignatureState::Invalid,
        }
    }
}

#[async_trait]
impl PaymentGateway for MobipayGateway {
    fn id(&self) -> &'static str {
        "mobipay"
    }

    fn supported_methods(&self) -> &'static [&'static str] {
        &["mobile_money"]
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["KES", "GHS", "UGX", "TZS"]
    }

    fn handling_mode(&self, _method: &str) -> HandlingMode {
        // STK push: the platform collects directly, no redirect.
        HandlingMode::Direct
    }

    fn merchant_id(&self) -> Option<&str> {
        Some(&self.credentials.merchant_code)
    }

    fn map_status(&self, provider_status: &str) -> PaymentStatus {
        reduce_status(self.id(), STATUS_TABLE, provider_status)
    }

    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse> {
        let Some(msisdn) = request.customer.phone.as_deref() else {
            return Ok(PaymentResponse::failure(
                "failed",
                "mobile money collection requires the buyer's phone number",
            ));
        };

        let canonical = format!(
            "{}:{}:{}",
            self.credentials.merchant_code, request.reference, request.amount
        );
        let signature = self.sign_request(&canonical)?;

        let url = format!("{}/collections/request", self.credentials.base_url);
        let body = serde_json::json!({
            "merchant_code": self.credentials.merchant_code,
            "msisdn": msisdn,
            "amount": request.amount.to_string(),
            "currency": request.currency,
            "external_ref": request.reference,
            "narration": format!("tip purchase {}", request.reference),
        });

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.credentials.api_key)
            .header("x-request-signature", signature)
            .json(&body)
            .send()
            .await
            .context("mobipay collection request failed")?;

        let parsed: ApiResponse = resp
            .json()
            .await
            .context("mobipay collection response was not valid JSON")?;

        if parsed.result_code != "0" {
            return Ok(PaymentResponse::failure(
                "failed",
                parsed
                    .result_desc
                    .unwrap_or_else(|| format!("mobipay result code {}", parsed.result_code)),
            ));
        }

        debug!(reference = %request.reference, "mobipay STK push accepted");
        Ok(PaymentResponse {
            success: true,
            provider_tx_id: parsed.transaction_id,
            status: "pending".to_string(),
            redirect_url: None,
            errors: Vec::new(),
        })
    }

    async fn check_payment_status(&self, provider_tx_id: &str) -> Result<StatusCheck> {
        let url = format!(
            "{}/collections/status/{}",
            self.credentials.base_url, provider_tx_id
        );
        let resp = self
            .client
            .get(&url)
            .header("x-api-key", &self.credentials.api_key)
            .send()
            .await
            .context("mobipay status request failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(StatusCheck::NotFound);
        }
        let parsed: ApiResponse = resp
            .json()
            .await
            .context("mobipay status response was not valid JSON")?;

        if parsed.result_code == "404" {
            return Ok(StatusCheck::NotFound);
        }
        if parsed.result_code != "0" {
            anyhow::bail!(
                "mobipay status check failed: {}",
                parsed.result_desc.unwrap_or_default()
            );
        }

        let status = parsed
            .status
            .context("mobipay status response missing status")?;
        Ok(StatusCheck::Reported(ProviderPaymentState {
            provider_tx_id: parsed.transaction_id,
            provider_status: status,
            raw: None,
        }))
    }

    fn parse_webhook(&self, raw: &RawWebhook) -> Result<WebhookEvent, WebhookError> {
        let signature = self.verify_signature(raw);

        let payload: serde_json::Value = serde_json::from_str(&raw.body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        let provider_tx_id = payload
            .get("transaction_id")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("transaction_id"))?
            .to_string();
        let reference = payload
            .get("external_ref")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let provider_status = payload
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("status"))?
            .to_string();
        let amount = payload
            .get("amount")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("amount"))
            .and_then(|s| {
                rust_decimal::Decimal::from_str(s)
                    .map_err(|e| WebhookError::InvalidPayload(format!("amount: {}", e)))
            })?;
        let currency = payload
            .get("currency")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MissingField("currency"))?
            .to_string();
        let completed_at = payload
            .get("completed_at")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let merchant_id = payload
            .get("merchant_code")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(WebhookEvent {
            provider_tx_id,
            reference,
            provider_status,
            amount,
            currency,
            completed_at,
            merchant_id,
            signature,
            raw: payload,
        })
    }

    async fn initiate_transfer(&self, request: &PayoutRequest) -> Result<PaymentResponse> {
        let canonical = format!(
            "{}:{}:{}",
            self.credentials.merchant_code, request.reference, request.amount
        );
        let signature = self.sign_request(&canonical)?;

        let url = format!("{}/disbursements/b2c", self.credentials.base_url);
        let body = serde_json::json!({
            "merchant_code": self.credentials.merchant_code,
            "account_number": request.account_number,
            "account_name": request.account_name,
            "bank_code": request.bank_code,
            "amount": request.amount.to_string(),
            "currency": request.currency,
            "external_ref": request.reference,
            "narration": request.narration,
        });

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.credentials.api_key)
            .header("x-request-signature", signature)
            .json(&body)
            .send()
            .await
            .context("mobipay disbursement request failed")?;

        let parsed: ApiResponse = resp
            .json()
            .await
            .context("mobipay disbursement response was not valid JSON")?;

        if parsed.result_code != "0" {
            return Ok(PaymentResponse::failure(
                "failed",
                parsed
                    .result_desc
                    .unwrap_or_else(|| format!("mobipay result code {}", parsed.result_code)),
            ));
        }

        Ok(PaymentResponse {
            success: true,
            provider_tx_id: parsed.transaction_id,
            status: parsed.status.unwrap_or_else(|| "pending".to_string()),
            redirect_url: None,
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn gateway() -> MobipayGateway {
        MobipayGateway::new(
            Client::new(),
            MobipayCredentials {
                api_key: "mk_test_key".to_string(),
                api_secret: "mk_test_secret".to_string(),
                merchant_code: "TF0042".to_string(),
                base_url: DEFAULT_BASE_URL.to_string(),
            },
        )
    }

    fn sign(secret: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn sample_body() -> String {
        serde_json::json!({
            "transaction_id": "MP-20260820-0001",
            "external_ref": "TIP-ref-1",
            "status": "SUCCESS",
            "amount": "250.00",
            "currency": "KES",
            "completed_at": "2026-08-20T09:00:00+00:00",
            "merchant_code": "TF0042"
        })
        .to_string()
    }

    #[test]
    fn parses_signed_webhook() {
        let gw = gateway();
        let body = sample_body();
        let sig = sign("mk_test_secret", &body);
        let raw = RawWebhook::new(body, vec![("X-Mobipay-Signature".to_string(), sig)]);

        let event = gw.parse_webhook(&raw).unwrap();
        assert_eq!(event.signature, SignatureState::Verified);
        assert_eq!(event.amount, dec!(250.00));
        assert_eq!(event.merchant_id.as_deref(), Some("TF0042"));
        assert_eq!(gw.map_status(&event.provider_status), PaymentStatus::Completed);
    }

    #[test]
    fn unsigned_webhook_reports_missing() {
        let gw = gateway();
        let raw = RawWebhook::new(sample_body(), Vec::<(String, String)>::new());
        let event = gw.parse_webhook(&raw).unwrap();
        assert_eq!(event.signature, SignatureState::Missing);
    }

    #[test]
    fn timeout_maps_to_failed_and_unknown_to_pending() {
        let gw = gateway();
        assert_eq!(gw.map_status("TIMEOUT"), PaymentStatus::Failed);
        assert_eq!(gw.map_status("user_cancelled"), PaymentStatus::Cancelled);
        assert_eq!(gw.map_status("SOMETHING_NEW"), PaymentStatus::Pending);
    }
}
