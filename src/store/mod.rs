//! Settlement datastore
//!
//! Single SQLite database holding payments, purchases, escrows, tips,
//! selections, mirrored match results, the platform revenue ledger and
//! persisted gateway configuration. All financial transitions go through
//! explicit transactions on this connection; schedulers and the webhook
//! path share it.

mod escrow;
mod payments;
mod tips;

pub use escrow::{SettleOutcome, SettlementInstruction};
pub use payments::{NewPayment, TransitionOutcome};

use crate::gateway::registry::GatewayConfigRecord;
use crate::models::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct SettlementDb {
    conn: Arc<Mutex<Connection>>,
}

impl SettlementDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open settlement db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory settlement db")?;
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tipster_id INTEGER NOT NULL,
                tipster_name TEXT NOT NULL,
                tipster_account_number TEXT,
                tipster_account_name TEXT,
                tipster_bank_code TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                is_ai INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_ref TEXT UNIQUE NOT NULL,
                home_team TEXT NOT NULL,
                away_team TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                home_score INTEGER,
                away_score INTEGER,
                kickoff_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tip_selections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tip_id INTEGER NOT NULL REFERENCES tips(id),
                match_id INTEGER NOT NULL REFERENCES matches(id),
                prediction_type TEXT NOT NULL,
                prediction_value TEXT NOT NULL,
                odds TEXT NOT NULL,
                is_correct INTEGER,
                is_void INTEGER NOT NULL DEFAULT 0,
                void_reason TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_selections_tip ON tip_selections(tip_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tip_id INTEGER NOT NULL REFERENCES tips(id),
                buyer_email TEXT NOT NULL,
                buyer_name TEXT NOT NULL,
                buyer_phone TEXT,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                tip_outcome TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_purchases_tip ON purchases(tip_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reference TEXT UNIQUE NOT NULL,
                purchase_id INTEGER NOT NULL REFERENCES purchases(id),
                kind TEXT NOT NULL DEFAULT 'purchase',
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                gateway_id TEXT NOT NULL,
                payment_method TEXT NOT NULL,
                provider_tx_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                provider_status TEXT,
                response_payload TEXT,
                webhook_fingerprint TEXT,
                failure_reason TEXT,
                email_sent INTEGER NOT NULL DEFAULT 0,
                admin_webhook_sent INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_payments_purchase ON payments(purchase_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_payments_status_kind ON payments(status, kind)",
            [],
        )?;
        // At most one completed collection payment per purchase.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_one_completed
             ON payments(purchase_id) WHERE status = 'completed' AND kind = 'purchase'",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS escrows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                purchase_id INTEGER UNIQUE NOT NULL REFERENCES purchases(id),
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'held',
                is_ai_tip INTEGER NOT NULL DEFAULT 0,
                held_at TEXT,
                released_at TEXT,
                release_type TEXT,
                platform_fee TEXT NOT NULL DEFAULT '0',
                platform_fee_percentage TEXT NOT NULL DEFAULT '0',
                tipster_earnings TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_escrows_status ON escrows(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS platform_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                escrow_id INTEGER NOT NULL REFERENCES escrows(id),
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS gateway_configs (
                gateway_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'active',
                supported_methods TEXT NOT NULL DEFAULT '[]',
                method_handling TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // ----- gateway config store -----

    pub async fn upsert_gateway_config(&self, rec: &GatewayConfigRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO gateway_configs (gateway_id, status, supported_methods, method_handling, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(gateway_id) DO UPDATE SET
                status = excluded.status,
                supported_methods = excluded.supported_methods,
                method_handling = excluded.method_handling,
                updated_at = excluded.updated_at",
            params![
                rec.gateway_id,
                rec.status,
                serde_json::to_string(&rec.supported_methods)?,
                serde_json::to_string(&rec.method_handling)?,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn load_gateway_configs(&self) -> Result<Vec<GatewayConfigRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT gateway_id, status, supported_methods, method_handling FROM gateway_configs",
        )?;
        let rows = stmt.query_map([], |row| {
            let gateway_id: String = row.get(0)?;
            let status: String = row.get(1)?;
            let methods_json: String = row.get(2)?;
            let handling_json: String = row.get(3)?;
            Ok((gateway_id, status, methods_json, handling_json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (gateway_id, status, methods_json, handling_json) = row?;
            out.push(GatewayConfigRecord {
                gateway_id,
                status,
                supported_methods: serde_json::from_str(&methods_json)
                    .context("parse supported_methods")?,
                method_handling: serde_json::from_str(&handling_json)
                    .context("parse method_handling")?,
            });
        }
        Ok(out)
    }

    // ----- catalog fixtures (owned by excluded collaborators; the pipeline
    // only reads these, writes come from tests and the admin surface) -----

    pub async fn insert_tip(
        &self,
        tipster_id: i64,
        tipster_name: &str,
        destination: Option<(&str, &str, &str)>,
        is_ai: bool,
    ) -> Result<i64> {
        let now = ts_to_sql(Utc::now());
        let (num, name, bank) = match destination {
            Some((a, b, c)) => (Some(a), Some(b), Some(c)),
            None => (None, None, None),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tips (tipster_id, tipster_name, tipster_account_number,
                tipster_account_name, tipster_bank_code, status, is_ai, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7)",
            params![tipster_id, tipster_name, num, name, bank, is_ai as i64, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn insert_match(
        &self,
        external_ref: &str,
        home_team: &str,
        away_team: &str,
        kickoff_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO matches (external_ref, home_team, away_team, status, kickoff_at)
             VALUES (?1, ?2, ?3, 'scheduled', ?4)",
            params![external_ref, home_team, away_team, ts_to_sql(kickoff_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn set_match_result(
        &self,
        match_id: i64,
        status: MatchStatus,
        home_score: Option<i64>,
        away_score: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE matches SET status = ?2, home_score = ?3, away_score = ?4 WHERE id = ?1",
            params![match_id, status.as_str(), home_score, away_score],
        )?;
        Ok(())
    }

    pub async fn insert_selection(
        &self,
        tip_id: i64,
        match_id: i64,
        prediction_type: PredictionType,
        prediction_value: &str,
        odds: Decimal,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tip_selections (tip_id, match_id, prediction_type, prediction_value, odds)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tip_id,
                match_id,
                prediction_type.as_str(),
                prediction_value,
                odds.to_string()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn insert_purchase(
        &self,
        tip_id: i64,
        buyer_email: &str,
        buyer_name: &str,
        buyer_phone: Option<&str>,
        amount: Decimal,
        currency: &str,
    ) -> Result<i64> {
        let now = ts_to_sql(Utc::now());
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO purchases (tip_id, buyer_email, buyer_name, buyer_phone,
                amount, currency, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
            params![
                tip_id,
                buyer_email,
                buyer_name,
                buyer_phone,
                amount.to_string(),
                currency,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn purchase_by_id(&self, id: i64) -> Result<Option<Purchase>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_PURCHASE))?;
        let mut rows = stmt.query_map(params![id], row_to_purchase)?;
        rows.next().transpose().context("read purchase")
    }

    pub async fn tip_by_id(&self, id: i64) -> Result<Option<Tip>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_TIP))?;
        let mut rows = stmt.query_map(params![id], row_to_tip)?;
        rows.next().transpose().context("read tip")
    }

    pub async fn match_by_id(&self, id: i64) -> Result<Option<MatchRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_MATCH))?;
        let mut rows = stmt.query_map(params![id], row_to_match)?;
        rows.next().transpose().context("read match")
    }
}

// ----- column helpers shared by the impl blocks -----

pub(crate) const SELECT_PAYMENT: &str = "SELECT id, reference, purchase_id, kind, amount, currency,
    gateway_id, payment_method, provider_tx_id, status, provider_status, response_payload,
    webhook_fingerprint, failure_reason, email_sent, admin_webhook_sent, retry_count,
    created_at, updated_at FROM payments";

pub(crate) const SELECT_PURCHASE: &str = "SELECT id, tip_id, buyer_email, buyer_name, buyer_phone,
    amount, currency, status, tip_outcome, created_at, updated_at FROM purchases";

pub(crate) const SELECT_ESCROW: &str = "SELECT id, purchase_id, amount, currency, status, is_ai_tip,
    held_at, released_at, release_type, platform_fee, platform_fee_percentage, tipster_earnings,
    created_at, updated_at FROM escrows";

pub(crate) const SELECT_TIP: &str = "SELECT id, tipster_id, tipster_name, tipster_account_number,
    tipster_account_name, tipster_bank_code, status, is_ai, created_at, updated_at FROM tips";

pub(crate) const SELECT_SELECTION: &str = "SELECT id, tip_id, match_id, prediction_type,
    prediction_value, odds, is_correct, is_void, void_reason FROM tip_selections";

pub(crate) const SELECT_MATCH: &str = "SELECT id, external_ref, home_team, away_team, status,
    home_score, away_score, kickoff_at FROM matches";

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn conv_err(idx: usize, err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

pub(crate) fn ts_from_sql(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv_err(idx, e.into()))
}

pub(crate) fn opt_ts_from_sql(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| ts_from_sql(idx, r)).transpose()
}

pub(crate) fn dec_from_sql(idx: usize, raw: String) -> rusqlite::Result<Decimal> {
    Decimal::from_str(&raw).map_err(|e| conv_err(idx, e.into()))
}

pub(crate) fn parse_from_sql<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    raw.parse::<T>().map_err(|e| conv_err(idx, e))
}

pub(crate) fn row_to_payment(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        reference: row.get(1)?,
        purchase_id: row.get(2)?,
        kind: parse_from_sql(3, row.get::<_, String>(3)?)?,
        amount: dec_from_sql(4, row.get::<_, String>(4)?)?,
        currency: row.get(5)?,
        gateway_id: row.get(6)?,
        payment_method: row.get(7)?,
        provider_tx_id: row.get(8)?,
        status: parse_from_sql(9, row.get::<_, String>(9)?)?,
        provider_status: row.get(10)?,
        response_payload: row.get(11)?,
        webhook_fingerprint: row.get(12)?,
        failure_reason: row.get(13)?,
        email_sent: row.get::<_, i64>(14)? != 0,
        admin_webhook_sent: row.get::<_, i64>(15)? != 0,
        retry_count: row.get(16)?,
        created_at: ts_from_sql(17, row.get::<_, String>(17)?)?,
        updated_at: ts_from_sql(18, row.get::<_, String>(18)?)?,
    })
}

pub(crate) fn row_to_purchase(row: &Row<'_>) -> rusqlite::Result<Purchase> {
    Ok(Purchase {
        id: row.get(0)?,
        tip_id: row.get(1)?,
        buyer_email: row.get(2)?,
        buyer_name: row.get(3)?,
        buyer_phone: row.get(4)?,
        amount: dec_from_sql(5, row.get::<_, String>(5)?)?,
        currency: row.get(6)?,
        status: parse_from_sql(7, row.get::<_, String>(7)?)?,
        tip_outcome: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_from_sql(8, s))
            .transpose()?,
        created_at: ts_from_sql(9, row.get::<_, String>(9)?)?,
        updated_at: ts_from_sql(10, row.get::<_, String>(10)?)?,
    })
}

pub(crate) fn row_to_escrow(row: &Row<'_>) -> rusqlite::Result<Escrow> {
    Ok(Escrow {
        id: row.get(0)?,
        purchase_id: row.get(1)?,
        amount: dec_from_sql(2, row.get::<_, String>(2)?)?,
        currency: row.get(3)?,
        status: parse_from_sql(4, row.get::<_, String>(4)?)?,
        is_ai_tip: row.get::<_, i64>(5)? != 0,
        held_at: opt_ts_from_sql(6, row.get(6)?)?,
        released_at: opt_ts_from_sql(7, row.get(7)?)?,
        release_type: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_from_sql(8, s))
            .transpose()?,
        platform_fee: dec_from_sql(9, row.get::<_, String>(9)?)?,
        platform_fee_percentage: dec_from_sql(10, row.get::<_, String>(10)?)?,
        tipster_earnings: dec_from_sql(11, row.get::<_, String>(11)?)?,
        created_at: ts_from_sql(12, row.get::<_, String>(12)?)?,
        updated_at: ts_from_sql(13, row.get::<_, String>(13)?)?,
    })
}

pub(crate) fn row_to_tip(row: &Row<'_>) -> rusqlite::Result<Tip> {
    Ok(Tip {
        id: row.get(0)?,
        tipster_id: row.get(1)?,
        tipster_name: row.get(2)?,
        tipster_account_number: row.get(3)?,
        tipster_account_name: row.get(4)?,
        tipster_bank_code: row.get(5)?,
        status: parse_from_sql(6, row.get::<_, String>(6)?)?,
        is_ai: row.get::<_, i64>(7)? != 0,
        created_at: ts_from_sql(8, row.get::<_, String>(8)?)?,
        updated_at: ts_from_sql(9, row.get::<_, String>(9)?)?,
    })
}

pub(crate) fn row_to_selection(row: &Row<'_>) -> rusqlite::Result<TipSelection> {
    Ok(TipSelection {
        id: row.get(0)?,
        tip_id: row.get(1)?,
        match_id: row.get(2)?,
        prediction_type: parse_from_sql(3, row.get::<_, String>(3)?)?,
        prediction_value: row.get(4)?,
        odds: dec_from_sql(5, row.get::<_, String>(5)?)?,
        is_correct: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
        is_void: row.get::<_, i64>(7)? != 0,
        void_reason: row.get(8)?,
    })
}

pub(crate) fn row_to_match(row: &Row<'_>) -> rusqlite::Result<MatchRecord> {
    Ok(MatchRecord {
        id: row.get(0)?,
        external_ref: row.get(1)?,
        home_team: row.get(2)?,
        away_team: row.get(3)?,
        status: parse_from_sql(4, row.get::<_, String>(4)?)?,
        home_score: row.get(5)?,
        away_score: row.get(6)?,
        kickoff_at: ts_from_sql(7, row.get::<_, String>(7)?)?,
    })
}
