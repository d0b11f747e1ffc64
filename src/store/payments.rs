//! Payment row operations, including the transactional webhook transition.

use super::*;
use tracing::warn;

/// Insert payload for a new payment attempt.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub reference: String,
    pub purchase_id: i64,
    pub kind: PaymentKind,
    pub amount: Decimal,
    pub currency: String,
    pub gateway_id: String,
    pub payment_method: String,
}

/// Result of a guarded status transition. `Skipped` carries the fresh row so
/// callers can tell a lost race from a genuine re-delivery.
#[derive(Debug)]
pub enum TransitionOutcome {
    Applied(Payment),
    Skipped(Payment),
}

impl TransitionOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            TransitionOutcome::Applied(p) | TransitionOutcome::Skipped(p) => p,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

impl SettlementDb {
    pub async fn insert_payment(&self, new: &NewPayment, now: DateTime<Utc>) -> Result<Payment> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO payments (reference, purchase_id, kind, amount, currency,
                gateway_id, payment_method, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
            params![
                new.reference,
                new.purchase_id,
                new.kind.as_str(),
                new.amount.to_string(),
                new.currency,
                new.gateway_id,
                new.payment_method,
                ts_to_sql(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_PAYMENT))?;
        let payment = stmt.query_row(params![id], row_to_payment)?;
        Ok(payment)
    }

    pub async fn payment_by_id(&self, id: i64) -> Result<Option<Payment>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_PAYMENT))?;
        let mut rows = stmt.query_map(params![id], row_to_payment)?;
        rows.next().transpose().context("read payment")
    }

    pub async fn payment_by_reference(&self, reference: &str) -> Result<Option<Payment>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!("{} WHERE reference = ?1", SELECT_PAYMENT))?;
        let mut rows = stmt.query_map(params![reference], row_to_payment)?;
        rows.next().transpose().context("read payment by reference")
    }

    pub async fn payment_by_provider_tx(
        &self,
        gateway_id: &str,
        provider_tx_id: &str,
    ) -> Result<Option<Payment>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE gateway_id = ?1 AND provider_tx_id = ?2",
            SELECT_PAYMENT
        ))?;
        let mut rows = stmt.query_map(params![gateway_id, provider_tx_id], row_to_payment)?;
        rows.next().transpose().context("read payment by provider tx")
    }

    pub async fn payments_for_purchase(&self, purchase_id: i64) -> Result<Vec<Payment>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE purchase_id = ?1 ORDER BY id",
            SELECT_PAYMENT
        ))?;
        let rows = stmt.query_map(params![purchase_id], row_to_payment)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read payments for purchase")
    }

    /// Pending collection payments created on or after `oldest` (status sweep
    /// window: a backstop for missed webhooks, not the primary path).
    pub async fn pending_purchase_payments_since(
        &self,
        oldest: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE status = 'pending' AND kind = 'purchase' AND created_at >= ?1 ORDER BY id",
            SELECT_PAYMENT
        ))?;
        let rows = stmt.query_map(params![ts_to_sql(oldest)], row_to_payment)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read recent pending payments")
    }

    /// Pending collection payments created before `cutoff` (cleanup sweep).
    pub async fn pending_purchase_payments_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE status = 'pending' AND kind = 'purchase' AND created_at < ?1 ORDER BY id",
            SELECT_PAYMENT
        ))?;
        let rows = stmt.query_map(params![ts_to_sql(cutoff)], row_to_payment)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read stale pending payments")
    }

    /// Payout/refund payments still pending initiation or confirmation.
    pub async fn pending_outbound_payments(&self, max_retries: i64) -> Result<Vec<Payment>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE status = 'pending' AND kind IN ('payout', 'refund')
               AND retry_count < ?1 ORDER BY id",
            SELECT_PAYMENT
        ))?;
        let rows = stmt.query_map(params![max_retries], row_to_payment)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read pending outbound payments")
    }

    /// Apply a status transition to a payment and cascade to its purchase,
    /// atomically. The UPDATE is guarded on `status = 'pending'`; if another
    /// writer got there first the transition becomes a no-op and the fresh
    /// row is returned as `Skipped`.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_payment_transition(
        &self,
        payment_id: i64,
        new_status: PaymentStatus,
        provider_tx_id: Option<&str>,
        provider_status: Option<&str>,
        response_payload: Option<&str>,
        fingerprint: Option<&str>,
        failure_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let mut conn = self.conn().lock().await;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE payments SET
                status = ?2,
                provider_tx_id = COALESCE(?3, provider_tx_id),
                provider_status = COALESCE(?4, provider_status),
                response_payload = COALESCE(?5, response_payload),
                webhook_fingerprint = COALESCE(?6, webhook_fingerprint),
                failure_reason = COALESCE(?7, failure_reason),
                updated_at = ?8
             WHERE id = ?1 AND status = 'pending'",
            params![
                payment_id,
                new_status.as_str(),
                provider_tx_id,
                provider_status,
                response_payload,
                fingerprint,
                failure_reason,
                ts_to_sql(now),
            ],
        )?;

        if changed == 0 {
            tx.finish()?;
            let payment = self
                .payment_by_id_locked(&conn, payment_id)?
                .context("payment vanished during transition")?;
            return Ok(TransitionOutcome::Skipped(payment));
        }

        // Cascade to the purchase: collection payments only, and only off
        // pending (monotonic). Payout/refund completion happens long after
        // the purchase is terminal and must leave it alone.
        if new_status.is_terminal() {
            let kind: String = tx.query_row(
                "SELECT kind FROM payments WHERE id = ?1",
                params![payment_id],
                |row| row.get(0),
            )?;
            if kind == "purchase" {
                let purchase_status = match new_status {
                    PaymentStatus::Completed => PurchaseStatus::Completed,
                    PaymentStatus::Cancelled => PurchaseStatus::Cancelled,
                    _ => PurchaseStatus::Failed,
                };
                let cascaded = tx.execute(
                    "UPDATE purchases SET status = ?2, updated_at = ?3
                     WHERE id = (SELECT purchase_id FROM payments WHERE id = ?1)
                       AND status = 'pending'",
                    params![payment_id, purchase_status.as_str(), ts_to_sql(now)],
                )?;
                if cascaded == 0 && new_status == PaymentStatus::Completed {
                    warn!(
                        payment_id,
                        "payment completed but purchase was no longer pending"
                    );
                }
            }
        }

        tx.commit()?;
        let payment = self
            .payment_by_id_locked(&conn, payment_id)?
            .context("payment vanished after transition")?;
        Ok(TransitionOutcome::Applied(payment))
    }

    fn payment_by_id_locked(&self, conn: &Connection, id: i64) -> Result<Option<Payment>> {
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_PAYMENT))?;
        let mut rows = stmt.query_map(params![id], row_to_payment)?;
        rows.next().transpose().context("read payment")
    }

    /// Record the provider's initiation response on a still-pending payment.
    pub async fn record_initiation(
        &self,
        payment_id: i64,
        provider_tx_id: Option<&str>,
        provider_status: Option<&str>,
        response_payload: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE payments SET
                provider_tx_id = COALESCE(?2, provider_tx_id),
                provider_status = COALESCE(?3, provider_status),
                response_payload = COALESCE(?4, response_payload),
                updated_at = ?5
             WHERE id = ?1",
            params![
                payment_id,
                provider_tx_id,
                provider_status,
                response_payload,
                ts_to_sql(now)
            ],
        )?;
        Ok(())
    }

    pub async fn bump_payment_retry(&self, payment_id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE payments SET retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?1",
            params![payment_id, ts_to_sql(now)],
        )?;
        Ok(())
    }

    /// Flip the buyer-email flag. Returns false if it was already set, so a
    /// retried notification path never double-sends.
    pub async fn mark_email_sent(&self, payment_id: i64) -> Result<bool> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE payments SET email_sent = 1 WHERE id = ?1 AND email_sent = 0",
            params![payment_id],
        )?;
        Ok(changed > 0)
    }

    pub async fn mark_admin_webhook_sent(&self, payment_id: i64) -> Result<bool> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE payments SET admin_webhook_sent = 1 WHERE id = ?1 AND admin_webhook_sent = 0",
            params![payment_id],
        )?;
        Ok(changed > 0)
    }
}
