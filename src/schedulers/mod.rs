//! Periodic settlement jobs
//!
//! A small fixed set of interval-driven loops sharing the settlement
//! datastore. Every job body takes an injected `now` and is safe to invoke
//! out of schedule, so tests drive them directly without timers. Each loop
//! is individually flagged and gated by a master enable flag.

pub mod evaluation_sweep;
pub mod reconciliation;
pub mod settlement;
pub mod tip_outcome;

pub use settlement::SettlementPolicy;

use crate::gateway::registry::GatewayRegistry;
use crate::notify::Notifier;
use crate::store::SettlementDb;
use chrono::Utc;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

fn env_flag(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_u64(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_i64(var: &str, default: i64) -> i64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

/// Operational surface for the scheduled jobs; environment-supplied at
/// process start, no runtime API to change it.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub master_enabled: bool,

    pub status_sweep_enabled: bool,
    pub status_sweep_interval_secs: u64,
    /// Only payments created within this window are polled; the sweep is a
    /// backstop for missed webhooks, not the primary path.
    pub status_sweep_window_mins: i64,

    pub cleanup_enabled: bool,
    pub cleanup_interval_secs: u64,
    pub cleanup_age_hours: i64,

    pub payout_sweep_enabled: bool,
    pub payout_sweep_interval_secs: u64,
    pub payout_max_retries: i64,

    pub selection_eval_enabled: bool,
    pub selection_eval_interval_secs: u64,

    pub tip_outcome_enabled: bool,
    pub tip_outcome_interval_secs: u64,

    pub settlement_enabled: bool,
    pub settlement_interval_secs: u64,
}

impl SchedulerSettings {
    pub fn from_env() -> Self {
        Self {
            master_enabled: env_flag("SCHEDULERS_ENABLED", true),
            status_sweep_enabled: env_flag("RECON_STATUS_SWEEP_ENABLED", true),
            status_sweep_interval_secs: env_u64("RECON_STATUS_SWEEP_INTERVAL_SECS", 6 * 3600),
            status_sweep_window_mins: env_i64("RECON_MAX_AGE_MINS", 30),
            cleanup_enabled: env_flag("RECON_CLEANUP_ENABLED", true),
            cleanup_interval_secs: env_u64("RECON_CLEANUP_INTERVAL_SECS", 24 * 3600),
            cleanup_age_hours: env_i64("RECON_CLEANUP_AGE_HOURS", 24),
            payout_sweep_enabled: env_flag("PAYOUT_SWEEP_ENABLED", true),
            payout_sweep_interval_secs: env_u64("PAYOUT_SWEEP_INTERVAL_SECS", 6 * 3600),
            payout_max_retries: env_i64("PAYOUT_MAX_RETRIES", 10),
            selection_eval_enabled: env_flag("SELECTION_EVAL_ENABLED", true),
            selection_eval_interval_secs: env_u64("SELECTION_EVAL_INTERVAL_SECS", 900),
            tip_outcome_enabled: env_flag("TIP_OUTCOME_ENABLED", true),
            tip_outcome_interval_secs: env_u64("TIP_OUTCOME_INTERVAL_SECS", 900),
            settlement_enabled: env_flag("SETTLEMENT_ENABLED", true),
            settlement_interval_secs: env_u64("SETTLEMENT_INTERVAL_SECS", 1800),
        }
    }
}

/// Spawn every enabled scheduler loop. Each loop swallows and logs
/// per-run errors; a broken run never kills the loop.
pub fn spawn_all(
    db: SettlementDb,
    registry: Arc<GatewayRegistry>,
    notifier: Notifier,
    policy: SettlementPolicy,
    settings: SchedulerSettings,
) {
    if !settings.master_enabled {
        warn!("schedulers disabled via SCHEDULERS_ENABLED, nothing spawned");
        return;
    }

    if settings.status_sweep_enabled {
        let (db, registry, notifier) = (db.clone(), registry.clone(), notifier.clone());
        let window_mins = settings.status_sweep_window_mins;
        spawn_loop(
            "payment-status-sweep",
            settings.status_sweep_interval_secs,
            move || {
                let (db, registry, notifier) = (db.clone(), registry.clone(), notifier.clone());
                async move {
                    reconciliation::run_status_sweep(&db, &registry, &notifier, window_mins, Utc::now())
                        .await
                        .map(|stats| info!(?stats, "payment status sweep done"))
                }
            },
        );
    }

    if settings.cleanup_enabled {
        let (db, notifier) = (db.clone(), notifier.clone());
        let age_hours = settings.cleanup_age_hours;
        spawn_loop(
            "payment-cleanup-sweep",
            settings.cleanup_interval_secs,
            move || {
                let (db, notifier) = (db.clone(), notifier.clone());
                async move {
                    reconciliation::run_cleanup_sweep(&db, &notifier, age_hours, Utc::now())
                        .await
                        .map(|stats| info!(?stats, "payment cleanup sweep done"))
                }
            },
        );
    }

    if settings.payout_sweep_enabled {
        let (db, registry) = (db.clone(), registry.clone());
        let max_retries = settings.payout_max_retries;
        spawn_loop(
            "payout-reconciliation",
            settings.payout_sweep_interval_secs,
            move || {
                let (db, registry) = (db.clone(), registry.clone());
                async move {
                    reconciliation::run_payout_sweep(&db, &registry, max_retries, Utc::now())
                        .await
                        .map(|stats| info!(?stats, "payout reconciliation done"))
                }
            },
        );
    }

    if settings.selection_eval_enabled {
        let db = db.clone();
        spawn_loop(
            "selection-evaluation",
            settings.selection_eval_interval_secs,
            move || {
                let db = db.clone();
                async move {
                    evaluation_sweep::run_selection_evaluation(&db)
                        .await
                        .map(|stats| info!(?stats, "selection evaluation done"))
                }
            },
        );
    }

    if settings.tip_outcome_enabled {
        let db = db.clone();
        spawn_loop(
            "tip-outcome",
            settings.tip_outcome_interval_secs,
            move || {
                let db = db.clone();
                async move {
                    tip_outcome::run_tip_outcome(&db, Utc::now())
                        .await
                        .map(|stats| info!(?stats, "tip outcome pass done"))
                }
            },
        );
    }

    if settings.settlement_enabled {
        spawn_loop(
            "escrow-settlement",
            settings.settlement_interval_secs,
            move || {
                let (db, registry, policy) = (db.clone(), registry.clone(), policy.clone());
                async move {
                    settlement::run_escrow_settlement(&db, &registry, &policy, Utc::now())
                        .await
                        .map(|stats| info!(?stats, "escrow settlement pass done"))
                }
            },
        );
    }
}

fn spawn_loop<F, Fut>(name: &'static str, interval_secs: u64, mut job: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        info!(job = name, interval_secs, "scheduler loop started");
        let mut ticker = interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = job().await {
                error!(job = name, error = %e, "scheduled run failed");
            }
        }
    });
}
