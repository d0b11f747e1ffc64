//! The shared webhook application pipeline.

use super::{fingerprint, WebhookAck, WebhookError};
use crate::gateway::registry::GatewayRegistry;
use crate::gateway::{RawWebhook, SignatureState};
use crate::models::{Payment, PaymentKind, PaymentStatus, RuntimeEnv};
use crate::notify::{Notifier, OrderNotification};
use crate::store::{SettlementDb, TransitionOutcome};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// How far in the past a webhook's completion timestamp may lie before it
/// is treated as a potential replay.
const STALENESS_WINDOW_HOURS: i64 = 24;

pub struct WebhookProcessor {
    db: SettlementDb,
    registry: Arc<GatewayRegistry>,
    notifier: Notifier,
    environment: RuntimeEnv,
}

impl WebhookProcessor {
    pub fn new(
        db: SettlementDb,
        registry: Arc<GatewayRegistry>,
        notifier: Notifier,
        environment: RuntimeEnv,
    ) -> Self {
        Self {
            db,
            registry,
            notifier,
            environment,
        }
    }

    /// Validate, authenticate and idempotently apply one inbound webhook.
    pub async fn process(
        &self,
        gateway_id: &str,
        raw: &RawWebhook,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, WebhookError> {
        let adapter = self
            .registry
            .adapter(gateway_id)
            .ok_or_else(|| WebhookError::UnknownGateway(gateway_id.to_string()))?;

        // 1. Parse & structurally validate; the adapter also checks the
        //    provider signature and reports what it saw.
        let event = adapter.parse_webhook(raw)?;

        // 2. Signature policy. A failed verification is rejected in every
        //    environment; a missing one only in production, to keep sandbox
        //    testing workable.
        match event.signature {
            SignatureState::Verified => {}
            SignatureState::Invalid => return Err(WebhookError::InvalidSignature),
            SignatureState::Missing => {
                if self.environment.is_production() {
                    return Err(WebhookError::MissingSignature);
                }
                warn!(gateway = gateway_id, "unsigned webhook allowed outside production");
            }
            SignatureState::NoKeyConfigured => {
                warn!(
                    gateway = gateway_id,
                    "webhook accepted without verification: no key configured"
                );
            }
        }

        // 3. Locate the payment: business reference first, provider tx id
        //    as fallback. A webhook never creates a payment.
        let payment = self.locate_payment(gateway_id, &event.reference, &event.provider_tx_id).await?;

        // 4. Cross-checks guarding against cross-account replay/misrouting.
        if !payment.currency.eq_ignore_ascii_case(&event.currency) {
            return Err(WebhookError::CurrencyMismatch {
                expected: payment.currency.clone(),
                got: event.currency.clone(),
            });
        }
        if payment.amount != event.amount {
            return Err(WebhookError::AmountMismatch {
                expected: payment.amount,
                got: event.amount,
            });
        }
        if let (Some(expected), Some(got)) = (adapter.merchant_id(), event.merchant_id.as_deref()) {
            if expected != got {
                return Err(WebhookError::MerchantMismatch {
                    expected: expected.to_string(),
                    got: got.to_string(),
                });
            }
        }

        // 5. Staleness. Pre-creation timestamps are tolerated as clock skew
        //    but logged as suspicious.
        if let Some(completed_at) = event.completed_at {
            let age = now - completed_at;
            if age > Duration::hours(STALENESS_WINDOW_HOURS) {
                return Err(WebhookError::StaleEvent {
                    age_hours: age.num_hours(),
                });
            }
            if completed_at < payment.created_at {
                warn!(
                    payment_id = payment.id,
                    completed_at = %completed_at,
                    created_at = %payment.created_at,
                    "webhook completion predates payment creation"
                );
            }
        }

        // 6. Idempotency fingerprint.
        let fp = fingerprint(
            &event.provider_tx_id,
            &event.provider_status,
            event.amount,
            event.completed_at,
        );
        let mapped = adapter.map_status(&event.provider_status);

        if payment.webhook_fingerprint.as_deref() == Some(fp.as_str())
            && payment.status == mapped
        {
            run_terminal_side_effects(&self.db, &self.notifier, &payment, now)
                .await
                .map_err(WebhookError::Internal)?;
            return Ok(WebhookAck::ok(
                payment.status.as_str(),
                "duplicate delivery, already processed",
            ));
        }

        // 7. Terminal payments accept only idempotent re-deliveries; other
        //    transitions are logged and ignored, never re-applied. A matching
        //    re-delivery re-runs the side effects so a crash between the
        //    payment transaction and escrow creation is repaired here.
        if payment.status.is_terminal() {
            if mapped != payment.status {
                warn!(
                    payment_id = payment.id,
                    current = payment.status.as_str(),
                    incoming = mapped.as_str(),
                    "ignoring invalid transition on terminal payment"
                );
            } else {
                run_terminal_side_effects(&self.db, &self.notifier, &payment, now)
                    .await
                    .map_err(WebhookError::Internal)?;
            }
            return Ok(WebhookAck::ok(
                payment.status.as_str(),
                "payment already settled, event ignored",
            ));
        }

        // 8-9. Atomic apply + exactly-once side effects.
        let payload = serde_json::to_string(&event.raw).ok();
        let outcome = apply_status_change(
            &self.db,
            &self.notifier,
            &payment,
            mapped,
            Some(&event.provider_tx_id),
            Some(&event.provider_status),
            payload.as_deref(),
            Some(&fp),
            None,
            now,
        )
        .await
        .map_err(WebhookError::Internal)?;

        let final_status = outcome.payment().status;
        let message = if outcome.was_applied() {
            "webhook applied"
        } else {
            "no state change"
        };
        Ok(WebhookAck::ok(final_status.as_str(), message))
    }

    async fn locate_payment(
        &self,
        gateway_id: &str,
        reference: &Option<String>,
        provider_tx_id: &str,
    ) -> Result<Payment, WebhookError> {
        if let Some(reference) = reference {
            if let Some(payment) = self
                .db
                .payment_by_reference(reference)
                .await
                .map_err(WebhookError::Internal)?
            {
                return Ok(payment);
            }
        }
        if let Some(payment) = self
            .db
            .payment_by_provider_tx(gateway_id, provider_tx_id)
            .await
            .map_err(WebhookError::Internal)?
        {
            return Ok(payment);
        }
        Err(WebhookError::UnknownPayment {
            reference: reference.clone(),
            provider_tx_id: Some(provider_tx_id.to_string()),
        })
    }
}

/// Apply a payment status change and its completion/failure side effects.
/// Shared by the webhook path and the reconciliation sweeps so both are
/// equally idempotent: the transition is guarded on the payment still being
/// pending, and each notification is gated by its own persisted flag.
#[allow(clippy::too_many_arguments)]
pub async fn apply_status_change(
    db: &SettlementDb,
    notifier: &Notifier,
    payment: &Payment,
    new_status: PaymentStatus,
    provider_tx_id: Option<&str>,
    provider_status: Option<&str>,
    response_payload: Option<&str>,
    fp: Option<&str>,
    failure_reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let outcome = db
        .apply_payment_transition(
            payment.id,
            new_status,
            provider_tx_id,
            provider_status,
            response_payload,
            fp,
            failure_reason,
            now,
        )
        .await?;

    if !outcome.was_applied() || !new_status.is_terminal() {
        return Ok(outcome);
    }

    run_terminal_side_effects(db, notifier, outcome.payment(), now).await?;
    Ok(outcome)
}

/// Escrow creation and buyer/admin notifications for a terminal purchase
/// payment. Every step is individually idempotent (INSERT OR IGNORE escrow,
/// flag-gated notifications), so re-running after a partial failure only
/// fills in what is missing.
pub async fn run_terminal_side_effects(
    db: &SettlementDb,
    notifier: &Notifier,
    payment: &Payment,
    now: DateTime<Utc>,
) -> Result<()> {
    // Outbound (payout/refund) payments settle escrows, they never create
    // them; their completion carries no buyer-facing side effects here.
    if payment.kind != PaymentKind::Purchase || !payment.status.is_terminal() {
        return Ok(());
    }
    let purchase = db
        .purchase_by_id(payment.purchase_id)
        .await?
        .context("purchase missing for payment")?;

    match payment.status {
        PaymentStatus::Completed => {
            let tip = db
                .tip_by_id(purchase.tip_id)
                .await?
                .context("tip missing for purchase")?;

            let created = db.create_escrow_if_absent(&purchase, tip.is_ai, now).await?;
            if created {
                info!(
                    payment_id = payment.id,
                    purchase_id = purchase.id,
                    amount = %purchase.amount,
                    "💰 payment completed, escrow held"
                );
            }

            if db.mark_email_sent(payment.id).await? {
                notifier
                    .send_payment_success(
                        &purchase.buyer_email,
                        &payment.reference,
                        payment.amount,
                        &payment.payment_method,
                        &purchase.buyer_name,
                    )
                    .await;
            }

            if !payment.admin_webhook_sent {
                let delivered = notifier
                    .send_order_notification(&OrderNotification::from_completed(
                        &purchase, payment, now,
                    ))
                    .await;
                if delivered {
                    db.mark_admin_webhook_sent(payment.id).await?;
                }
            }
        }
        PaymentStatus::Failed | PaymentStatus::Cancelled => {
            if db.mark_email_sent(payment.id).await? {
                notifier
                    .send_payment_failure(
                        &purchase.buyer_email,
                        &payment.reference,
                        payment.amount,
                        &payment.payment_method,
                        &purchase.buyer_name,
                    )
                    .await;
            }
        }
        PaymentStatus::Pending => {}
    }

    Ok(())
}
