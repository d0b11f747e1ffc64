//! Escrow settlement
//!
//! Distributes held funds once a tip's outcome and its purchase are both
//! final. The escrow's terminal transition and its ledger payment commit in
//! one transaction; the external transfer is initiated afterwards and its
//! failure never blocks the release (payout reconciliation retries it).

use crate::gateway::registry::GatewayRegistry;
use crate::gateway::{PayoutRequest, StatusCheck};
use crate::models::*;
use crate::store::{NewPayment, SettleOutcome, SettlementDb, SettlementInstruction};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    /// Platform commission on non-AI winning tips, e.g. 0.10.
    pub commission_rate: Decimal,
    /// Gateway carrying outbound payouts and refunds.
    pub payout_gateway_id: String,
}

impl SettlementPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            commission_rate: config.platform_commission_rate,
            payout_gateway_id: std::env::var("PAYOUT_GATEWAY_ID")
                .unwrap_or_else(|_| "mobipay".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSplit {
    pub release_type: ReleaseType,
    pub platform_fee: Decimal,
    pub platform_fee_percentage: Decimal,
    pub tipster_earnings: Decimal,
}

/// Fee arithmetic for one escrow. Invariant: for platform revenue and
/// tipster payouts, platform_fee + tipster_earnings == amount; a refund
/// zeroes both.
pub fn compute_split(
    amount: Decimal,
    tip_status: TipStatus,
    is_ai_tip: bool,
    commission_rate: Decimal,
) -> FeeSplit {
    match tip_status {
        TipStatus::Won if is_ai_tip => FeeSplit {
            release_type: ReleaseType::PlatformRevenue,
            platform_fee: amount,
            platform_fee_percentage: Decimal::new(100, 0),
            tipster_earnings: Decimal::ZERO,
        },
        TipStatus::Won => {
            let platform_fee = (amount * commission_rate).round_dp(2);
            FeeSplit {
                release_type: ReleaseType::TipsterPayout,
                platform_fee,
                platform_fee_percentage: commission_rate * Decimal::new(100, 0),
                tipster_earnings: amount - platform_fee,
            }
        }
        // Lost, void and cancelled tips all refund the buyer in full.
        _ => FeeSplit {
            release_type: ReleaseType::BuyerRefund,
            platform_fee: Decimal::ZERO,
            platform_fee_percentage: Decimal::ZERO,
            tipster_earnings: Decimal::ZERO,
        },
    }
}

#[derive(Debug, Default)]
pub struct SettlementStats {
    pub examined: usize,
    pub released: usize,
    pub refunded: usize,
    pub platform_revenue: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub async fn run_escrow_settlement(
    db: &SettlementDb,
    registry: &GatewayRegistry,
    policy: &SettlementPolicy,
    now: DateTime<Utc>,
) -> Result<SettlementStats> {
    let candidates = db.escrows_ready_for_settlement().await?;
    let mut stats = SettlementStats::default();

    for (escrow, purchase, tip) in candidates {
        stats.examined += 1;
        match settle_one(db, registry, policy, &escrow, &purchase, &tip, now).await {
            Ok(Some(release_type)) => match release_type {
                ReleaseType::TipsterPayout => stats.released += 1,
                ReleaseType::BuyerRefund => stats.refunded += 1,
                ReleaseType::PlatformRevenue => stats.platform_revenue += 1,
            },
            Ok(None) => stats.skipped += 1,
            Err(e) => {
                // One escrow's failure must not abort the batch.
                warn!(escrow_id = escrow.id, error = %e, "escrow settlement failed");
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

async fn settle_one(
    db: &SettlementDb,
    registry: &GatewayRegistry,
    policy: &SettlementPolicy,
    escrow: &Escrow,
    purchase: &Purchase,
    tip: &Tip,
    now: DateTime<Utc>,
) -> Result<Option<ReleaseType>> {
    let split = compute_split(escrow.amount, tip.status, escrow.is_ai_tip, policy.commission_rate);

    let outbound = match split.release_type {
        ReleaseType::PlatformRevenue => None,
        ReleaseType::TipsterPayout => Some(NewPayment {
            reference: format!("PO-{}", Uuid::new_v4().simple()),
            purchase_id: purchase.id,
            kind: PaymentKind::Payout,
            amount: split.tipster_earnings,
            currency: escrow.currency.clone(),
            gateway_id: policy.payout_gateway_id.clone(),
            payment_method: "bank_transfer".to_string(),
        }),
        ReleaseType::BuyerRefund => Some(NewPayment {
            reference: format!("RF-{}", Uuid::new_v4().simple()),
            purchase_id: purchase.id,
            kind: PaymentKind::Refund,
            amount: escrow.amount,
            currency: escrow.currency.clone(),
            gateway_id: policy.payout_gateway_id.clone(),
            payment_method: "mobile_money".to_string(),
        }),
    };

    let ledger_entry = match split.release_type {
        ReleaseType::PlatformRevenue => Some((
            "ai_tip_revenue".to_string(),
            format!("AI tip #{} won, full escrow retained", tip.id),
        )),
        ReleaseType::TipsterPayout if split.platform_fee > Decimal::ZERO => Some((
            "commission".to_string(),
            format!("commission on tip #{}", tip.id),
        )),
        _ => None,
    };

    let instruction = SettlementInstruction {
        release_type: split.release_type,
        platform_fee: split.platform_fee,
        platform_fee_percentage: split.platform_fee_percentage,
        tipster_earnings: split.tipster_earnings,
        outbound,
        ledger_entry,
    };

    let outcome = db.settle_escrow(escrow.id, &instruction, now).await?;
    let (escrow, outbound) = match outcome {
        SettleOutcome::Applied { escrow, outbound } => (escrow, outbound),
        SettleOutcome::AlreadySettled(_) => return Ok(None),
    };

    // Release of escrow and completion of the external transfer are
    // decoupled stages: from here on, nothing rolls the escrow back.
    if let Some(payment) = outbound {
        match payment.kind {
            PaymentKind::Payout if tip.payout_destination().is_none() => {
                warn!(
                    tip_id = tip.id,
                    payment_id = payment.id,
                    "tipster has no payout destination, leaving payout pending"
                );
            }
            PaymentKind::Refund if purchase.buyer_phone.is_none() => {
                warn!(
                    purchase_id = purchase.id,
                    payment_id = payment.id,
                    "buyer has no refund destination, leaving refund pending"
                );
            }
            _ => {
                if let Err(e) = attempt_outbound_transfer(db, registry, &payment, now).await {
                    warn!(
                        payment_id = payment.id,
                        error = %e,
                        "transfer initiation failed, payout reconciliation will retry"
                    );
                }
            }
        }
    }

    info!(
        escrow_id = escrow.id,
        release_type = instruction.release_type.as_str(),
        platform_fee = %instruction.platform_fee,
        tipster_earnings = %instruction.tipster_earnings,
        "escrow distribution recorded"
    );
    Ok(Some(instruction.release_type))
}

/// Initiate (or, once initiated, confirm) one outbound payout/refund
/// payment. Returns true when the payment reached completed.
pub async fn attempt_outbound_transfer(
    db: &SettlementDb,
    registry: &GatewayRegistry,
    payment: &Payment,
    now: DateTime<Utc>,
) -> Result<bool> {
    let adapter = registry
        .adapter(&payment.gateway_id)
        .with_context(|| format!("no adapter for payout gateway '{}'", payment.gateway_id))?;

    // Already initiated: poll instead of re-sending money.
    if let Some(provider_tx_id) = payment.provider_tx_id.as_deref() {
        let state = match adapter.check_payment_status(provider_tx_id).await? {
            StatusCheck::Reported(state) => state,
            StatusCheck::NotFound => return Ok(false),
        };
        let mapped = adapter.map_status(&state.provider_status);
        if mapped.is_terminal() {
            let outcome = db
                .apply_payment_transition(
                    payment.id,
                    mapped,
                    state.provider_tx_id.as_deref(),
                    Some(&state.provider_status),
                    None,
                    None,
                    None,
                    now,
                )
                .await?;
            return Ok(outcome.was_applied() && mapped == PaymentStatus::Completed);
        }
        return Ok(false);
    }

    let (account_number, account_name, bank_code, narration) = destination_for(db, payment).await?;
    let request = PayoutRequest {
        reference: payment.reference.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        account_number,
        account_name,
        bank_code,
        narration,
    };

    let response = adapter.initiate_transfer(&request).await?;
    if !response.success {
        warn!(
            payment_id = payment.id,
            errors = ?response.errors,
            "transfer initiation rejected"
        );
        return Ok(false);
    }

    db.record_initiation(
        payment.id,
        response.provider_tx_id.as_deref(),
        Some(&response.status),
        None,
        now,
    )
    .await?;

    let mapped = adapter.map_status(&response.status);
    if mapped == PaymentStatus::Completed {
        let outcome = db
            .apply_payment_transition(
                payment.id,
                PaymentStatus::Completed,
                response.provider_tx_id.as_deref(),
                Some(&response.status),
                None,
                None,
                None,
                now,
            )
            .await?;
        return Ok(outcome.was_applied());
    }
    Ok(false)
}

async fn destination_for(
    db: &SettlementDb,
    payment: &Payment,
) -> Result<(String, String, String, String)> {
    let purchase = db
        .purchase_by_id(payment.purchase_id)
        .await?
        .context("purchase missing for outbound payment")?;

    match payment.kind {
        PaymentKind::Payout => {
            let tip = db
                .tip_by_id(purchase.tip_id)
                .await?
                .context("tip missing for payout")?;
            let (number, name, bank) = tip
                .payout_destination()
                .context("tipster payout destination incomplete")?;
            Ok((
                number.to_string(),
                name.to_string(),
                bank.to_string(),
                format!("tip #{} earnings", tip.id),
            ))
        }
        PaymentKind::Refund => {
            let phone = purchase
                .buyer_phone
                .clone()
                .context("buyer refund destination missing")?;
            Ok((
                phone,
                purchase.buyer_name.clone(),
                "MOBILE".to_string(),
                format!("refund for purchase #{}", purchase.id),
            ))
        }
        PaymentKind::Purchase => anyhow::bail!("collection payment has no outbound destination"),
    }
}
