//! Selection evaluation sweep
//!
//! Scores unevaluated selections whose matches have data, persisting each
//! verdict. Runs ahead of the tip outcome pass so partial match completion
//! never blocks scoring the legs that can already be decided.

use crate::evaluation::evaluate;
use crate::store::SettlementDb;
use anyhow::Result;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct EvaluationStats {
    pub examined: usize,
    pub decided: usize,
    pub voided: usize,
    pub undecided: usize,
    pub errors: usize,
}

pub async fn run_selection_evaluation(db: &SettlementDb) -> Result<EvaluationStats> {
    let batch = db.unevaluated_selections().await?;
    let mut stats = EvaluationStats::default();

    for (selection, m) in batch {
        stats.examined += 1;
        let verdict = evaluate(&selection, &m);

        if !verdict.is_decided() {
            stats.undecided += 1;
            continue;
        }

        if verdict.is_void {
            debug!(
                selection_id = selection.id,
                reason = verdict.reason.as_deref().unwrap_or(""),
                "selection voided"
            );
            stats.voided += 1;
        } else {
            stats.decided += 1;
        }

        // One bad row must not abort the rest of the batch.
        if let Err(e) = db
            .save_selection_verdict(
                selection.id,
                verdict.is_correct,
                verdict.is_void,
                verdict.reason.as_deref(),
            )
            .await
        {
            warn!(selection_id = selection.id, error = %e, "failed to persist verdict");
            stats.errors += 1;
        }
    }

    Ok(stats)
}
