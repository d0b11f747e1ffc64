//! Prediction evaluation engine
//!
//! Pure scoring of one selection against one match result. No I/O, no
//! clock: same input always yields the same verdict, so batch order never
//! matters. Parse failures inside a single selection become a void verdict
//! with the reason recorded; they never abort evaluation of other legs.

use crate::models::{MatchRecord, MatchStatus, PredictionType, TipSelection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// None while the leg is not yet decidable.
    pub is_correct: Option<bool>,
    pub is_void: bool,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn correct(value: bool) -> Self {
        Self {
            is_correct: Some(value),
            is_void: false,
            reason: None,
        }
    }

    pub fn unknown() -> Self {
        Self {
            is_correct: None,
            is_void: false,
            reason: None,
        }
    }

    pub fn void(reason: impl Into<String>) -> Self {
        Self {
            is_correct: None,
            is_void: true,
            reason: Some(reason.into()),
        }
    }

    pub fn is_decided(&self) -> bool {
        self.is_correct.is_some() || self.is_void
    }
}

/// Score one selection against its match.
pub fn evaluate(selection: &TipSelection, m: &MatchRecord) -> Verdict {
    match m.status {
        MatchStatus::Cancelled => return Verdict::void("match cancelled"),
        MatchStatus::Postponed => return Verdict::void("match postponed"),
        MatchStatus::Finished => {}
        MatchStatus::Scheduled | MatchStatus::Live => return Verdict::unknown(),
    }
    let (Some(home), Some(away)) = (m.home_score, m.away_score) else {
        // Finished but not yet scored: revisit on the next sweep.
        return Verdict::unknown();
    };

    let value = selection.prediction_value.trim();
    match selection.prediction_type {
        PredictionType::MatchResult => match_result(value, home, away),
        PredictionType::OverUnder => over_under(value, home, away),
        PredictionType::BothTeamsToScore => both_teams_to_score(value, home, away),
        PredictionType::DoubleChance => double_chance(value, home, away),
        PredictionType::Handicap => handicap(value, home, away),
        PredictionType::CorrectScore => correct_score(value, home, away),
        PredictionType::FirstScorer => {
            Verdict::void("first scorer requires scorer data not modeled here")
        }
        PredictionType::Other => Verdict::void("unsupported prediction type"),
    }
}

fn match_result(value: &str, home: i64, away: i64) -> Verdict {
    let predicted = match value {
        "home_win" => home > away,
        "away_win" => away > home,
        "draw" => home == away,
        other => return Verdict::void(format!("malformed match result value '{}'", other)),
    };
    Verdict::correct(predicted)
}

fn over_under(value: &str, home: i64, away: i64) -> Verdict {
    let Some((direction, threshold_raw)) = value.split_once('_') else {
        return Verdict::void(format!("malformed over/under value '{}'", value));
    };
    let threshold: f64 = match threshold_raw.parse() {
        Ok(t) => t,
        Err(e) => return Verdict::void(format!("bad over/under threshold '{}': {}", threshold_raw, e)),
    };
    let total = (home + away) as f64;
    match direction {
        "over" => Verdict::correct(total > threshold),
        "under" => Verdict::correct(total < threshold),
        other => Verdict::void(format!("malformed over/under direction '{}'", other)),
    }
}

fn both_teams_to_score(value: &str, home: i64, away: i64) -> Verdict {
    let both_scored = home > 0 && away > 0;
    match value {
        "btts_yes" | "yes" => Verdict::correct(both_scored),
        "btts_no" | "no" => Verdict::correct(!both_scored),
        other => Verdict::void(format!("malformed both-teams-to-score value '{}'", other)),
    }
}

fn double_chance(value: &str, home: i64, away: i64) -> Verdict {
    let home_win = home > away;
    let away_win = away > home;
    let draw = home == away;
    let covered = match value {
        "home_draw" => home_win || draw,
        "home_away" => home_win || away_win,
        "draw_away" => draw || away_win,
        other => return Verdict::void(format!("malformed double chance value '{}'", other)),
    };
    Verdict::correct(covered)
}

fn handicap(value: &str, home: i64, away: i64) -> Verdict {
    // Encoded as "<side>_<signed line>", e.g. "home_-1.5": the line is
    // applied to the home score before comparing.
    let Some((side, line_raw)) = value.split_once('_') else {
        return Verdict::void(format!("malformed handicap value '{}'", value));
    };
    let line: f64 = match line_raw.parse() {
        Ok(l) => l,
        Err(e) => return Verdict::void(format!("bad handicap line '{}': {}", line_raw, e)),
    };
    let adjusted_home = home as f64 + line;
    let away = away as f64;
    match side {
        "home" => Verdict::correct(adjusted_home > away),
        "away" => Verdict::correct(adjusted_home < away),
        other => Verdict::void(format!("malformed handicap side '{}'", other)),
    }
}

fn correct_score(value: &str, home: i64, away: i64) -> Verdict {
    let Some((h_raw, a_raw)) = value.split_once('-') else {
        return Verdict::void(format!("malformed correct score value '{}'", value));
    };
    let (Ok(h), Ok(a)) = (h_raw.trim().parse::<i64>(), a_raw.trim().parse::<i64>()) else {
        return Verdict::void(format!("malformed correct score value '{}'", value));
    };
    Verdict::correct(h == home && a == away)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn selection(prediction_type: PredictionType, value: &str) -> TipSelection {
        TipSelection {
            id: 1,
            tip_id: 1,
            match_id: 1,
            prediction_type,
            prediction_value: value.to_string(),
            odds: dec!(1.85),
            is_correct: None,
            is_void: false,
            void_reason: None,
        }
    }

    fn finished(home: i64, away: i64) -> MatchRecord {
        MatchRecord {
            id: 1,
            external_ref: "m1".to_string(),
            home_team: "Alpha".to_string(),
            away_team: "Beta".to_string(),
            status: MatchStatus::Finished,
            home_score: Some(home),
            away_score: Some(away),
            kickoff_at: Utc::now(),
        }
    }

    #[test]
    fn undecidable_until_finished_and_scored() {
        let sel = selection(PredictionType::MatchResult, "home_win");
        let mut m = finished(2, 1);
        m.status = MatchStatus::Live;
        assert_eq!(evaluate(&sel, &m), Verdict::unknown());

        m.status = MatchStatus::Finished;
        m.away_score = None;
        assert_eq!(evaluate(&sel, &m), Verdict::unknown());
    }

    #[test]
    fn cancelled_and_postponed_void_the_leg() {
        let sel = selection(PredictionType::MatchResult, "home_win");
        let mut m = finished(0, 0);
        m.status = MatchStatus::Cancelled;
        assert!(evaluate(&sel, &m).is_void);
        m.status = MatchStatus::Postponed;
        assert!(evaluate(&sel, &m).is_void);
    }

    #[test]
    fn match_result_scenarios() {
        // 2-1 home win, over 2.5 lands, btts_no misses.
        let m = finished(2, 1);
        assert_eq!(
            evaluate(&selection(PredictionType::MatchResult, "home_win"), &m),
            Verdict::correct(true)
        );
        assert_eq!(
            evaluate(&selection(PredictionType::OverUnder, "over_2.5"), &m),
            Verdict::correct(true)
        );
        assert_eq!(
            evaluate(&selection(PredictionType::BothTeamsToScore, "btts_no"), &m),
            Verdict::correct(false)
        );
    }

    #[test]
    fn draw_and_away_results() {
        let m = finished(1, 1);
        assert_eq!(
            evaluate(&selection(PredictionType::MatchResult, "draw"), &m),
            Verdict::correct(true)
        );
        let m = finished(0, 3);
        assert_eq!(
            evaluate(&selection(PredictionType::MatchResult, "home_win"), &m),
            Verdict::correct(false)
        );
        assert_eq!(
            evaluate(&selection(PredictionType::MatchResult, "away_win"), &m),
            Verdict::correct(true)
        );
    }

    #[test]
    fn over_under_boundaries() {
        let m = finished(1, 1);
        assert_eq!(
            evaluate(&selection(PredictionType::OverUnder, "over_2.5"), &m),
            Verdict::correct(false)
        );
        assert_eq!(
            evaluate(&selection(PredictionType::OverUnder, "under_2.5"), &m),
            Verdict::correct(true)
        );
        let bad = evaluate(&selection(PredictionType::OverUnder, "over_x"), &m);
        assert!(bad.is_void);
        assert!(bad.reason.unwrap().contains("threshold"));
    }

    #[test]
    fn double_chance_covers_pairs() {
        let m = finished(1, 1);
        assert_eq!(
            evaluate(&selection(PredictionType::DoubleChance, "home_draw"), &m),
            Verdict::correct(true)
        );
        assert_eq!(
            evaluate(&selection(PredictionType::DoubleChance, "home_away"), &m),
            Verdict::correct(false)
        );
        assert_eq!(
            evaluate(&selection(PredictionType::DoubleChance, "draw_away"), &m),
            Verdict::correct(true)
        );
    }

    #[test]
    fn handicap_applies_line_to_home_score() {
        let m = finished(2, 1);
        // 2 - 1.5 = 0.5 > 1 is false.
        assert_eq!(
            evaluate(&selection(PredictionType::Handicap, "home_-1.5"), &m),
            Verdict::correct(false)
        );
        // 2 - 0.5 = 1.5 > 1 holds.
        assert_eq!(
            evaluate(&selection(PredictionType::Handicap, "home_-0.5"), &m),
            Verdict::correct(true)
        );
        // Away +1.5: adjusted home 3.5 < 1 is false.
        assert_eq!(
            evaluate(&selection(PredictionType::Handicap, "away_+1.5"), &m),
            Verdict::correct(false)
        );
    }

    #[test]
    fn correct_score_is_exact() {
        let m = finished(2, 1);
        assert_eq!(
            evaluate(&selection(PredictionType::CorrectScore, "2-1"), &m),
            Verdict::correct(true)
        );
        assert_eq!(
            evaluate(&selection(PredictionType::CorrectScore, "1-2"), &m),
            Verdict::correct(false)
        );
        let bad = evaluate(&selection(PredictionType::CorrectScore, "two-one"), &m);
        assert!(bad.is_void);
    }

    #[test]
    fn unsupported_types_void_with_explicit_reason() {
        let m = finished(2, 1);
        let fs = evaluate(&selection(PredictionType::FirstScorer, "anyone"), &m);
        assert!(fs.is_void);
        assert!(fs.reason.unwrap().contains("scorer data"));
        let other = evaluate(&selection(PredictionType::Other, "custom"), &m);
        assert!(other.is_void);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let sel = selection(PredictionType::OverUnder, "over_2.5");
        let m = finished(3, 1);
        let first = evaluate(&sel, &m);
        for _ in 0..10 {
            assert_eq!(evaluate(&sel, &m), first);
        }
    }
}
