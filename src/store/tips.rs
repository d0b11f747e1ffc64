//! Tip, selection and match reads plus the tip outcome transaction.

use super::*;

impl SettlementDb {
    /// Selections with no verdict yet, paired with their match rows.
    pub async fn unevaluated_selections(&self) -> Result<Vec<(TipSelection, MatchRecord)>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, m.id FROM tip_selections s
             JOIN matches m ON m.id = s.match_id
             WHERE s.is_correct IS NULL AND s.is_void = 0
             ORDER BY s.id",
        )?;
        let ids = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(ids.len());
        for (selection_id, match_id) in ids {
            let selection = {
                let mut stmt =
                    conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_SELECTION))?;
                stmt.query_row(params![selection_id], row_to_selection)?
            };
            let m = {
                let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_MATCH))?;
                stmt.query_row(params![match_id], row_to_match)?
            };
            out.push((selection, m));
        }
        Ok(out)
    }

    pub async fn save_selection_verdict(
        &self,
        selection_id: i64,
        is_correct: Option<bool>,
        is_void: bool,
        void_reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE tip_selections SET is_correct = ?2, is_void = ?3, void_reason = ?4
             WHERE id = ?1",
            params![
                selection_id,
                is_correct.map(|v| v as i64),
                is_void as i64,
                void_reason
            ],
        )?;
        Ok(())
    }

    pub async fn pending_tips(&self) -> Result<Vec<Tip>> {
        let conn = self.conn().lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE status = 'pending' ORDER BY id", SELECT_TIP))?;
        let rows = stmt.query_map([], row_to_tip)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read pending tips")
    }

    /// Selections of a tip together with the status of the underlying match.
    pub async fn selections_with_match_status(
        &self,
        tip_id: i64,
    ) -> Result<Vec<(TipSelection, MatchStatus)>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, m.status FROM tip_selections s
             JOIN matches m ON m.id = s.match_id
             WHERE s.tip_id = ?1
             ORDER BY s.id",
        )?;
        let pairs = stmt
            .query_map(params![tip_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(pairs.len());
        for (selection_id, status_raw) in pairs {
            let selection = {
                let mut stmt =
                    conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_SELECTION))?;
                stmt.query_row(params![selection_id], row_to_selection)?
            };
            let status: MatchStatus = status_raw.parse()?;
            out.push((selection, status));
        }
        Ok(out)
    }

    pub async fn selection_by_id(&self, id: i64) -> Result<Option<TipSelection>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_SELECTION))?;
        let mut rows = stmt.query_map(params![id], row_to_selection)?;
        rows.next().transpose().context("read selection")
    }

    /// Write the tip's final outcome and copy it onto every purchase that
    /// references the tip, in one transaction. Guarded on the tip still
    /// being pending.
    pub async fn set_tip_outcome(
        &self,
        tip_id: i64,
        outcome: TipStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn().lock().await;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE tips SET status = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![tip_id, outcome.as_str(), ts_to_sql(now)],
        )?;
        if changed == 0 {
            tx.finish()?;
            return Ok(false);
        }

        tx.execute(
            "UPDATE purchases SET tip_outcome = ?2, updated_at = ?3 WHERE tip_id = ?1",
            params![tip_id, outcome.as_str(), ts_to_sql(now)],
        )?;

        tx.commit()?;
        Ok(true)
    }

    pub async fn purchases_for_tip(&self, tip_id: i64) -> Result<Vec<Purchase>> {
        let conn = self.conn().lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE tip_id = ?1 ORDER BY id", SELECT_PURCHASE))?;
        let rows = stmt.query_map(params![tip_id], row_to_purchase)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read purchases for tip")
    }
}
