//! Outbound notifications
//!
//! Buyer emails go through the notification service fire-and-forget;
//! failures are logged, never propagated into the payment pipeline. The
//! admin order relay is retried a bounded number of times and reports
//! success back so the caller can gate its persisted sent-flag.

use crate::models::{Payment, Purchase};
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const ADMIN_RELAY_ATTEMPTS: u32 = 3;
const ADMIN_RELAY_INITIAL_BACKOFF_MS: u64 = 1_000;
const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize)]
struct PaymentEmail<'a> {
    reference: &'a str,
    amount: Decimal,
    method: &'a str,
    name: &'a str,
}

/// Order payload relayed to the admin webhook on completed payments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderNotification {
    pub order_id: i64,
    pub customer_id: String,
    pub total_amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_status: String,
    pub items: Vec<OrderItem>,
    pub order_date: DateTime<Utc>,
    pub customer_email: String,
    pub customer_name: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub description: String,
    pub amount: Decimal,
}

impl OrderNotification {
    pub fn from_completed(purchase: &Purchase, payment: &Payment, now: DateTime<Utc>) -> Self {
        Self {
            order_id: purchase.id,
            customer_id: purchase.buyer_email.clone(),
            total_amount: purchase.amount,
            currency: purchase.currency.clone(),
            status: purchase.status.as_str().to_string(),
            payment_status: payment.status.as_str().to_string(),
            items: vec![OrderItem {
                description: format!("tip #{}", purchase.tip_id),
                amount: purchase.amount,
            }],
            order_date: now,
            customer_email: purchase.buyer_email.clone(),
            customer_name: purchase.buyer_name.clone(),
            notes: None,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    client: Client,
    notification_base_url: Option<String>,
    admin_webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(notification_base_url: Option<String>, admin_webhook_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("Tipflow/1.0 (Settlement)")
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            notification_base_url,
            admin_webhook_url,
        }
    }

    /// Disabled notifier for tests: every send is a logged no-op and the
    /// admin relay reports success.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub async fn send_payment_success(
        &self,
        buyer_email: &str,
        reference: &str,
        amount: Decimal,
        method: &str,
        name: &str,
    ) {
        self.send_email(
            "payment-success",
            buyer_email,
            &PaymentEmail {
                reference,
                amount,
                method,
                name,
            },
        )
        .await;
    }

    pub async fn send_payment_failure(
        &self,
        buyer_email: &str,
        reference: &str,
        amount: Decimal,
        method: &str,
        name: &str,
    ) {
        self.send_email(
            "payment-failure",
            buyer_email,
            &PaymentEmail {
                reference,
                amount,
                method,
                name,
            },
        )
        .await;
    }

    async fn send_email(&self, template: &str, recipient: &str, payload: &PaymentEmail<'_>) {
        let Some(base) = &self.notification_base_url else {
            debug!(template, recipient, "notification service not configured, skipping email");
            return;
        };
        let url = format!("{}/notifications/{}", base.trim_end_matches('/'), template);
        let body = serde_json::json!({ "recipient": recipient, "payload": payload });
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(template, recipient, "notification dispatched");
            }
            Ok(resp) => {
                warn!(template, recipient, status = %resp.status(), "notification service rejected email");
            }
            Err(e) => {
                warn!(template, recipient, error = %e, "notification send failed");
            }
        }
    }

    /// Relay an order notification to the admin webhook with bounded retry.
    /// Returns true once the relay acknowledged the delivery.
    pub async fn send_order_notification(&self, order: &OrderNotification) -> bool {
        let Some(url) = &self.admin_webhook_url else {
            debug!(order_id = order.order_id, "admin webhook not configured, skipping relay");
            return true;
        };

        let mut backoff = Duration::from_millis(ADMIN_RELAY_INITIAL_BACKOFF_MS);
        for attempt in 1..=ADMIN_RELAY_ATTEMPTS {
            match self.client.post(url).json(order).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(order_id = order.order_id, attempt, "admin order notification delivered");
                    return true;
                }
                Ok(resp) => {
                    warn!(
                        order_id = order.order_id,
                        attempt,
                        status = %resp.status(),
                        "admin webhook rejected notification"
                    );
                }
                Err(e) => {
                    warn!(order_id = order.order_id, attempt, error = %e, "admin webhook unreachable");
                }
            }
            if attempt < ADMIN_RELAY_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        false
    }
}
