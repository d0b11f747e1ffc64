//! Payment reconciliation sweeps
//!
//! Backstops for missed webhooks. All three sweeps are re-entrant and safe
//! to race webhook delivery: the transition itself is guarded on the
//! payment still being pending, so the loser of any race becomes a no-op.

use crate::gateway::registry::GatewayRegistry;
use crate::gateway::StatusCheck;
use crate::models::PaymentStatus;
use crate::notify::Notifier;
use crate::schedulers::settlement::attempt_outbound_transfer;
use crate::store::SettlementDb;
use crate::webhook::apply_status_change;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SweepStats {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Poll the gateway for recent pending payments with no confirming webhook.
/// A completed result applies the same side effects as the webhook path.
pub async fn run_status_sweep(
    db: &SettlementDb,
    registry: &GatewayRegistry,
    notifier: &Notifier,
    window_mins: i64,
    now: DateTime<Utc>,
) -> Result<SweepStats> {
    let oldest = now - Duration::minutes(window_mins);
    let pending = db.pending_purchase_payments_since(oldest).await?;
    let mut stats = SweepStats::default();

    for payment in pending {
        stats.examined += 1;

        let Some(adapter) = registry.adapter(&payment.gateway_id) else {
            warn!(
                payment_id = payment.id,
                gateway = %payment.gateway_id,
                "no adapter registered for pending payment"
            );
            stats.skipped += 1;
            continue;
        };

        let lookup_id = payment
            .provider_tx_id
            .as_deref()
            .unwrap_or(&payment.reference);
        let state = match adapter.check_payment_status(lookup_id).await {
            Ok(StatusCheck::Reported(state)) => state,
            Ok(StatusCheck::NotFound) => {
                debug!(payment_id = payment.id, "gateway has no record yet");
                stats.skipped += 1;
                continue;
            }
            // Transient infrastructure errors are inconclusive; the payment
            // is revisited on the next sweep.
            Err(e) => {
                warn!(payment_id = payment.id, error = %e, "status check failed");
                stats.errors += 1;
                continue;
            }
        };

        let mapped = adapter.map_status(&state.provider_status);
        if mapped == PaymentStatus::Pending {
            stats.skipped += 1;
            continue;
        }

        // Fresh read immediately before mutation; a webhook may have won
        // the race since the batch query.
        let fresh = match db.payment_by_id(payment.id).await? {
            Some(p) if !p.status.is_terminal() => p,
            _ => {
                stats.skipped += 1;
                continue;
            }
        };

        match apply_status_change(
            db,
            notifier,
            &fresh,
            mapped,
            state.provider_tx_id.as_deref(),
            Some(&state.provider_status),
            None,
            None,
            None,
            now,
        )
        .await
        {
            Ok(outcome) if outcome.was_applied() => match mapped {
                PaymentStatus::Completed => stats.completed += 1,
                _ => stats.failed += 1,
            },
            Ok(_) => stats.skipped += 1,
            Err(e) => {
                warn!(payment_id = payment.id, error = %e, "sweep transition failed");
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

/// Force-fail pending payments older than the cleanup age, cascading to
/// their purchases.
pub async fn run_cleanup_sweep(
    db: &SettlementDb,
    notifier: &Notifier,
    age_hours: i64,
    now: DateTime<Utc>,
) -> Result<SweepStats> {
    let cutoff = now - Duration::hours(age_hours);
    let stale = db.pending_purchase_payments_before(cutoff).await?;
    let mut stats = SweepStats::default();

    for payment in stale {
        stats.examined += 1;
        match apply_status_change(
            db,
            notifier,
            &payment,
            PaymentStatus::Failed,
            None,
            None,
            None,
            None,
            Some("timeout"),
            now,
        )
        .await
        {
            Ok(outcome) if outcome.was_applied() => {
                info!(
                    payment_id = payment.id,
                    age_hours, "🧹 stale pending payment failed as timeout"
                );
                stats.failed += 1;
            }
            Ok(_) => stats.skipped += 1,
            Err(e) => {
                warn!(payment_id = payment.id, error = %e, "cleanup transition failed");
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

/// Retry initiation of payout/refund payments stuck pending after their
/// escrow was settled.
pub async fn run_payout_sweep(
    db: &SettlementDb,
    registry: &GatewayRegistry,
    max_retries: i64,
    now: DateTime<Utc>,
) -> Result<SweepStats> {
    let pending = db.pending_outbound_payments(max_retries).await?;
    let mut stats = SweepStats::default();

    for payment in pending {
        stats.examined += 1;
        match attempt_outbound_transfer(db, registry, &payment, now).await {
            Ok(true) => stats.completed += 1,
            Ok(false) => {
                // Once initiated, an inconclusive pass is a pure status poll
                // of a transfer the provider is still working; only
                // initiation attempts consume the retry budget.
                if payment.provider_tx_id.is_none() {
                    db.bump_payment_retry(payment.id, now).await?;
                }
                stats.skipped += 1;
            }
            Err(e) => {
                warn!(payment_id = payment.id, error = %e, "payout retry failed");
                db.bump_payment_retry(payment.id, now).await?;
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}
