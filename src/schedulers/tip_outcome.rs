//! Tip outcome determination
//!
//! Aggregates the evaluated legs of each pending tip into one WON / LOST /
//! VOID outcome once every underlying match is finished and scored, and
//! copies the outcome onto every purchase of the tip.

use crate::models::{MatchStatus, TipSelection, TipStatus};
use crate::store::SettlementDb;
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct OutcomeStats {
    pub examined: usize,
    pub won: usize,
    pub lost: usize,
    pub voided: usize,
    pub undetermined: usize,
}

/// Pure aggregation of leg verdicts into a tip outcome. None while the tip
/// is not yet determinable.
pub fn aggregate_outcome(selections: &[(TipSelection, MatchStatus)]) -> Option<TipStatus> {
    // No valid picks at all: nothing can win.
    if selections.is_empty() {
        return Some(TipStatus::Lost);
    }

    for (selection, match_status) in selections {
        if selection.is_void {
            continue;
        }
        // A leg on an unfinished match keeps the whole tip open, unless the
        // leg is already void (cancelled/postponed matches void their legs).
        if !matches!(
            match_status,
            MatchStatus::Finished | MatchStatus::Cancelled | MatchStatus::Postponed
        ) {
            return None;
        }
        if selection.is_correct.is_none() {
            return None;
        }
    }

    // One void leg voids the whole bundle; there is no partial settlement.
    if selections.iter().any(|(s, _)| s.is_void) {
        return Some(TipStatus::Void);
    }
    if selections
        .iter()
        .all(|(s, _)| s.is_correct == Some(true))
    {
        return Some(TipStatus::Won);
    }
    Some(TipStatus::Lost)
}

pub async fn run_tip_outcome(db: &SettlementDb, now: DateTime<Utc>) -> Result<OutcomeStats> {
    let pending = db.pending_tips().await?;
    let mut stats = OutcomeStats::default();

    for tip in pending {
        stats.examined += 1;
        let selections = db.selections_with_match_status(tip.id).await?;

        let Some(outcome) = aggregate_outcome(&selections) else {
            debug!(tip_id = tip.id, "tip not yet determinable");
            stats.undetermined += 1;
            continue;
        };

        if db.set_tip_outcome(tip.id, outcome, now).await? {
            info!(tip_id = tip.id, outcome = outcome.as_str(), "tip outcome set");
            match outcome {
                TipStatus::Won => stats.won += 1,
                TipStatus::Void => stats.voided += 1,
                _ => stats.lost += 1,
            }
        } else {
            stats.undetermined += 1;
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PredictionType;
    use rust_decimal_macros::dec;

    fn leg(is_correct: Option<bool>, is_void: bool, status: MatchStatus) -> (TipSelection, MatchStatus) {
        (
            TipSelection {
                id: 0,
                tip_id: 0,
                match_id: 0,
                prediction_type: PredictionType::MatchResult,
                prediction_value: "home_win".to_string(),
                odds: dec!(2.0),
                is_correct,
                is_void,
                void_reason: None,
            },
            status,
        )
    }

    #[test]
    fn empty_tip_is_lost() {
        assert_eq!(aggregate_outcome(&[]), Some(TipStatus::Lost));
    }

    #[test]
    fn unfinished_match_keeps_tip_open() {
        let legs = vec![
            leg(Some(true), false, MatchStatus::Finished),
            leg(None, false, MatchStatus::Live),
        ];
        assert_eq!(aggregate_outcome(&legs), None);
    }

    #[test]
    fn unevaluated_leg_keeps_tip_open() {
        let legs = vec![
            leg(Some(true), false, MatchStatus::Finished),
            leg(None, false, MatchStatus::Finished),
        ];
        assert_eq!(aggregate_outcome(&legs), None);
    }

    #[test]
    fn single_void_leg_voids_the_bundle() {
        let legs = vec![
            leg(Some(true), false, MatchStatus::Finished),
            leg(None, true, MatchStatus::Cancelled),
        ];
        assert_eq!(aggregate_outcome(&legs), Some(TipStatus::Void));
    }

    #[test]
    fn all_correct_wins_any_miss_loses() {
        let won = vec![
            leg(Some(true), false, MatchStatus::Finished),
            leg(Some(true), false, MatchStatus::Finished),
        ];
        assert_eq!(aggregate_outcome(&won), Some(TipStatus::Won));

        let lost = vec![
            leg(Some(true), false, MatchStatus::Finished),
            leg(Some(false), false, MatchStatus::Finished),
        ];
        assert_eq!(aggregate_outcome(&lost), Some(TipStatus::Lost));
    }
}
