//! Escrow rows and the settlement transaction.
//!
//! An escrow must never appear released without its accompanying ledger
//! payment, or vice versa, so the terminal transition, the outbound payment
//! row and the optional platform ledger entry commit together.

use super::*;
use crate::store::payments::NewPayment;
use tracing::info;

/// What the settlement scheduler decided for one escrow.
#[derive(Debug, Clone)]
pub struct SettlementInstruction {
    pub release_type: ReleaseType,
    pub platform_fee: Decimal,
    pub platform_fee_percentage: Decimal,
    pub tipster_earnings: Decimal,
    /// Outbound payout/refund payment to create alongside the transition.
    /// None for pure platform revenue (AI tips).
    pub outbound: Option<NewPayment>,
    /// Platform ledger entry, recorded for platform-revenue releases.
    pub ledger_entry: Option<(String, String)>, // (entry_type, description)
}

#[derive(Debug)]
pub enum SettleOutcome {
    /// Transition applied; carries the fresh escrow and the outbound payment
    /// row if one was created.
    Applied {
        escrow: Escrow,
        outbound: Option<Payment>,
    },
    /// The escrow was already terminal when re-read inside the transaction.
    AlreadySettled(Escrow),
}

impl SettlementDb {
    /// Create the escrow for a completed purchase, exactly once. Returns
    /// true if this call created it; re-deliveries hit the UNIQUE purchase
    /// constraint and return false.
    pub async fn create_escrow_if_absent(
        &self,
        purchase: &Purchase,
        is_ai_tip: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn().lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO escrows
                (purchase_id, amount, currency, status, is_ai_tip, held_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'held', ?4, ?5, ?5, ?5)",
            params![
                purchase.id,
                purchase.amount.to_string(),
                purchase.currency,
                is_ai_tip as i64,
                ts_to_sql(now),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub async fn escrow_by_purchase(&self, purchase_id: i64) -> Result<Option<Escrow>> {
        let conn = self.conn().lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE purchase_id = ?1", SELECT_ESCROW))?;
        let mut rows = stmt.query_map(params![purchase_id], row_to_escrow)?;
        rows.next().transpose().context("read escrow")
    }

    pub async fn escrow_by_id(&self, id: i64) -> Result<Option<Escrow>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_ESCROW))?;
        let mut rows = stmt.query_map(params![id], row_to_escrow)?;
        rows.next().transpose().context("read escrow")
    }

    /// Escrows whose purchase is completed and whose tip has a final outcome.
    /// Ordering across stages is enforced by this predicate alone; there is
    /// no cross-stage locking.
    pub async fn escrows_ready_for_settlement(&self) -> Result<Vec<(Escrow, Purchase, Tip)>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT e.id, p.id, t.id
             FROM escrows e
             JOIN purchases p ON p.id = e.purchase_id
             JOIN tips t ON t.id = p.tip_id
             WHERE e.status IN ('pending', 'held')
               AND p.status = 'completed'
               AND t.status NOT IN ('pending')
             ORDER BY e.id",
        )?;
        let ids = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(ids.len());
        for (escrow_id, purchase_id, tip_id) in ids {
            let escrow = {
                let mut stmt =
                    conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_ESCROW))?;
                stmt.query_row(params![escrow_id], row_to_escrow)?
            };
            let purchase = {
                let mut stmt =
                    conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_PURCHASE))?;
                stmt.query_row(params![purchase_id], row_to_purchase)?
            };
            let tip = {
                let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_TIP))?;
                stmt.query_row(params![tip_id], row_to_tip)?
            };
            out.push((escrow, purchase, tip));
        }
        Ok(out)
    }

    /// Move one escrow to its terminal state. Re-reads the escrow inside the
    /// transaction and skips if a previous run (or manual intervention)
    /// already settled it.
    pub async fn settle_escrow(
        &self,
        escrow_id: i64,
        instruction: &SettlementInstruction,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let mut conn = self.conn().lock().await;
        let tx = conn.transaction()?;

        let fresh = {
            let mut stmt = tx.prepare_cached(&format!("{} WHERE id = ?1", SELECT_ESCROW))?;
            stmt.query_row(params![escrow_id], row_to_escrow)?
        };
        if fresh.status.is_terminal() {
            tx.finish()?;
            return Ok(SettleOutcome::AlreadySettled(fresh));
        }

        let terminal = match instruction.release_type {
            ReleaseType::BuyerRefund => EscrowStatus::Refunded,
            _ => EscrowStatus::Released,
        };

        tx.execute(
            "UPDATE escrows SET
                status = ?2,
                release_type = ?3,
                platform_fee = ?4,
                platform_fee_percentage = ?5,
                tipster_earnings = ?6,
                held_at = COALESCE(held_at, ?7),
                released_at = ?7,
                updated_at = ?7
             WHERE id = ?1",
            params![
                escrow_id,
                terminal.as_str(),
                instruction.release_type.as_str(),
                instruction.platform_fee.to_string(),
                instruction.platform_fee_percentage.to_string(),
                instruction.tipster_earnings.to_string(),
                ts_to_sql(now),
            ],
        )?;

        let outbound = if let Some(new) = &instruction.outbound {
            tx.execute(
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
            let id = tx.last_insert_rowid();
            let mut stmt = tx.prepare_cached(&format!("{} WHERE id = ?1", SELECT_PAYMENT))?;
            Some(stmt.query_row(params![id], row_to_payment)?)
        } else {
            None
        };

        if let Some((entry_type, description)) = &instruction.ledger_entry {
            tx.execute(
                "INSERT INTO platform_ledger (escrow_id, amount, currency, entry_type, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    escrow_id,
                    instruction.platform_fee.to_string(),
                    fresh.currency,
                    entry_type,
                    description,
                    ts_to_sql(now),
                ],
            )?;
        }

        tx.commit()?;

        let escrow = {
            let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_ESCROW))?;
            stmt.query_row(params![escrow_id], row_to_escrow)?
        };
        info!(
            escrow_id,
            status = escrow.status.as_str(),
            release_type = instruction.release_type.as_str(),
            "escrow settled"
        );
        Ok(SettleOutcome::Applied { escrow, outbound })
    }

    pub async fn platform_ledger_entries(&self, escrow_id: i64) -> Result<Vec<(String, Decimal)>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT entry_type, amount FROM platform_ledger WHERE escrow_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![escrow_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (entry_type, amount) = row?;
            out.push((entry_type, dec_from_sql(1, amount)?));
        }
        Ok(out)
    }
}
