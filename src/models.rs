use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

/// Local payment status vocabulary. Every provider mapping must reduce to
/// this closed set; unknown provider statuses stay `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown payment status '{}'", other)),
        }
    }
}

/// What a payment row moves money for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    /// Buyer paying for a purchase (inbound).
    Purchase,
    /// Settlement paying a tipster (outbound).
    Payout,
    /// Settlement refunding a buyer (outbound).
    Refund,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Purchase => "purchase",
            PaymentKind::Payout => "payout",
            PaymentKind::Refund => "refund",
        }
    }
}

impl FromStr for PaymentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(PaymentKind::Purchase),
            "payout" => Ok(PaymentKind::Payout),
            "refund" => Ok(PaymentKind::Refund),
            other => Err(anyhow::anyhow!("unknown payment kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Failed => "failed",
            PurchaseStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for PurchaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PurchaseStatus::Pending),
            "completed" => Ok(PurchaseStatus::Completed),
            "failed" => Ok(PurchaseStatus::Failed),
            "cancelled" => Ok(PurchaseStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown purchase status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Held,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Held => "held",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded)
    }
}

impl FromStr for EscrowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EscrowStatus::Pending),
            "held" => Ok(EscrowStatus::Held),
            "released" => Ok(EscrowStatus::Released),
            "refunded" => Ok(EscrowStatus::Refunded),
            other => Err(anyhow::anyhow!("unknown escrow status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    PlatformRevenue,
    TipsterPayout,
    BuyerRefund,
}

impl ReleaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseType::PlatformRevenue => "platform_revenue",
            ReleaseType::TipsterPayout => "tipster_payout",
            ReleaseType::BuyerRefund => "buyer_refund",
        }
    }
}

impl FromStr for ReleaseType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform_revenue" => Ok(ReleaseType::PlatformRevenue),
            "tipster_payout" => Ok(ReleaseType::TipsterPayout),
            "buyer_refund" => Ok(ReleaseType::BuyerRefund),
            other => Err(anyhow::anyhow!("unknown release type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipStatus {
    Pending,
    Won,
    Lost,
    Void,
    Cancelled,
}

impl TipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TipStatus::Pending => "pending",
            TipStatus::Won => "won",
            TipStatus::Lost => "lost",
            TipStatus::Void => "void",
            TipStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TipStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TipStatus::Pending),
            "won" => Ok(TipStatus::Won),
            "lost" => Ok(TipStatus::Lost),
            "void" => Ok(TipStatus::Void),
            "cancelled" => Ok(TipStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown tip status '{}'", other)),
        }
    }
}

/// Match lifecycle as reported by the fixtures feed (external collaborator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Scheduled,
    Live,
    Finished,
    Cancelled,
    Postponed,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Scheduled => "scheduled",
            MatchStatus::Live => "live",
            MatchStatus::Finished => "finished",
            MatchStatus::Cancelled => "cancelled",
            MatchStatus::Postponed => "postponed",
        }
    }
}

impl FromStr for MatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(MatchStatus::Scheduled),
            "live" => Ok(MatchStatus::Live),
            "finished" => Ok(MatchStatus::Finished),
            "cancelled" => Ok(MatchStatus::Cancelled),
            "postponed" => Ok(MatchStatus::Postponed),
            other => Err(anyhow::anyhow!("unknown match status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    MatchResult,
    OverUnder,
    BothTeamsToScore,
    DoubleChance,
    Handicap,
    CorrectScore,
    FirstScorer,
    Other,
}

impl PredictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionType::MatchResult => "match_result",
            PredictionType::OverUnder => "over_under",
            PredictionType::BothTeamsToScore => "both_teams_to_score",
            PredictionType::DoubleChance => "double_chance",
            PredictionType::Handicap => "handicap",
            PredictionType::CorrectScore => "correct_score",
            PredictionType::FirstScorer => "first_scorer",
            PredictionType::Other => "other",
        }
    }
}

impl FromStr for PredictionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "match_result" => Ok(PredictionType::MatchResult),
            "over_under" => Ok(PredictionType::OverUnder),
            "both_teams_to_score" => Ok(PredictionType::BothTeamsToScore),
            "double_chance" => Ok(PredictionType::DoubleChance),
            "handicap" => Ok(PredictionType::Handicap),
            "correct_score" => Ok(PredictionType::CorrectScore),
            "first_scorer" => Ok(PredictionType::FirstScorer),
            "other" => Ok(PredictionType::Other),
            other => Err(anyhow::anyhow!("unknown prediction type '{}'", other)),
        }
    }
}

/// How a payment method collects funds: hosted checkout redirect vs direct
/// API collection. Unknown config entries fall back to `Direct` with a
/// warning rather than failing dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlingMode {
    CheckoutUrl,
    Direct,
}

impl HandlingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlingMode::CheckoutUrl => "checkout_url",
            HandlingMode::Direct => "direct",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "checkout_url" => HandlingMode::CheckoutUrl,
            "direct" => HandlingMode::Direct,
            other => {
                warn!(
                    mode = other,
                    "unknown payment method handling mode, defaulting to direct"
                );
                HandlingMode::Direct
            }
        }
    }
}

/// One attempt to move money for a purchase (or out of escrow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub reference: String,
    pub purchase_id: i64,
    pub kind: PaymentKind,
    pub amount: Decimal,
    pub currency: String,
    pub gateway_id: String,
    pub payment_method: String,
    pub provider_tx_id: Option<String>,
    pub status: PaymentStatus,
    pub provider_status: Option<String>,
    pub response_payload: Option<String>,
    pub webhook_fingerprint: Option<String>,
    pub failure_reason: Option<String>,
    pub email_sent: bool,
    pub admin_webhook_sent: bool,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A buyer's claim on a tip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: i64,
    pub tip_id: i64,
    pub buyer_email: String,
    pub buyer_name: String,
    pub buyer_phone: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PurchaseStatus,
    pub tip_outcome: Option<TipStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Platform-held funds for one purchase, pending the tip's outcome.
/// The single source of truth for whether money has left the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: i64,
    pub purchase_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub status: EscrowStatus,
    pub is_ai_tip: bool,
    pub held_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub release_type: Option<ReleaseType>,
    pub platform_fee: Decimal,
    pub platform_fee_percentage: Decimal,
    pub tipster_earnings: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sellable bundle of one or more match predictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tip {
    pub id: i64,
    pub tipster_id: i64,
    pub tipster_name: String,
    pub tipster_account_number: Option<String>,
    pub tipster_account_name: Option<String>,
    pub tipster_bank_code: Option<String>,
    pub status: TipStatus,
    pub is_ai: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tip {
    /// Payout destination is usable only when all three fields are present.
    pub fn payout_destination(&self) -> Option<(&str, &str, &str)> {
        match (
            self.tipster_account_number.as_deref(),
            self.tipster_account_name.as_deref(),
            self.tipster_bank_code.as_deref(),
        ) {
            (Some(num), Some(name), Some(bank)) => Some((num, name, bank)),
            _ => None,
        }
    }
}

/// One prediction against one match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipSelection {
    pub id: i64,
    pub tip_id: i64,
    pub match_id: i64,
    pub prediction_type: PredictionType,
    pub prediction_value: String,
    pub odds: Decimal,
    pub is_correct: Option<bool>,
    pub is_void: bool,
    pub void_reason: Option<String>,
}

impl TipSelection {
    /// Resolved once either verdict side is known.
    pub fn is_evaluated(&self) -> bool {
        self.is_correct.is_some() || self.is_void
    }
}

/// External fixtures data, mirrored locally for evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: i64,
    pub external_ref: String,
    pub home_team: String,
    pub away_team: String,
    pub status: MatchStatus,
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub kickoff_at: DateTime<Utc>,
}

/// Runtime environment. Gates the webhook signature leniency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnv {
    Production,
    Sandbox,
}

impl RuntimeEnv {
    pub fn is_production(&self) -> bool {
        matches!(self, RuntimeEnv::Production)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub environment: RuntimeEnv,
    /// Platform commission rate on non-AI winning tips, e.g. 0.10.
    pub platform_commission_rate: Decimal,
    pub notification_base_url: Option<String>,
    pub admin_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./tipflow.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let environment = match std::env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => RuntimeEnv::Production,
            _ => RuntimeEnv::Sandbox,
        };

        let platform_commission_rate = std::env::var("PLATFORM_COMMISSION_RATE")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .filter(|r| *r >= Decimal::ZERO && *r <= Decimal::ONE)
            .unwrap_or_else(|| Decimal::new(10, 2)); // 0.10

        let notification_base_url = std::env::var("NOTIFICATION_BASE_URL").ok();
        let admin_webhook_url = std::env::var("ADMIN_WEBHOOK_URL").ok();

        Ok(Self {
            database_path,
            port,
            environment,
            platform_commission_rate,
            notification_base_url,
            admin_webhook_url,
        })
    }
}
