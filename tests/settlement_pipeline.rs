//! End-to-end settlement pipeline tests: webhook intake through selection
//! evaluation, tip outcome and escrow distribution, against an in-memory
//! database and a gateway adapter with known credentials.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha2::Sha256;

use tipflow_backend::gateway::mobipay::{MobipayCredentials, MobipayGateway};
use tipflow_backend::gateway::registry::GatewayRegistry;
use tipflow_backend::gateway::{
    PaymentGateway, PaymentRequest, PaymentResponse, PayoutRequest, ProviderPaymentState,
    RawWebhook, StatusCheck, WebhookEvent,
};
use tipflow_backend::models::*;
use tipflow_backend::notify::Notifier;
use tipflow_backend::schedulers::evaluation_sweep::run_selection_evaluation;
use tipflow_backend::schedulers::reconciliation::{run_cleanup_sweep, run_payout_sweep};
use tipflow_backend::schedulers::settlement::{run_escrow_settlement, SettlementPolicy};
use tipflow_backend::schedulers::tip_outcome::run_tip_outcome;
use tipflow_backend::store::{NewPayment, SettlementDb};
use tipflow_backend::webhook::{apply_status_change, fingerprint, WebhookError, WebhookProcessor};

const API_SECRET: &str = "test-mobipay-secret";
const MERCHANT_CODE: &str = "MC-7781";

fn mobipay_adapter() -> MobipayGateway {
    MobipayGateway::new(
        reqwest::Client::new(),
        MobipayCredentials {
            api_key: "test-key".to_string(),
            api_secret: API_SECRET.to_string(),
            merchant_code: MERCHANT_CODE.to_string(),
            // Unroutable: any real HTTP call fails fast.
            base_url: "http://127.0.0.1:1".to_string(),
        },
    )
}

async fn harness() -> (SettlementDb, Arc<GatewayRegistry>) {
    let db = SettlementDb::open_in_memory().unwrap();
    let registry = GatewayRegistry::build(
        vec![Arc::new(mobipay_adapter()) as Arc<dyn PaymentGateway>],
        &db,
    )
    .await
    .unwrap();
    (db, registry)
}

fn processor(
    db: &SettlementDb,
    registry: &Arc<GatewayRegistry>,
    environment: RuntimeEnv,
) -> WebhookProcessor {
    WebhookProcessor::new(
        db.clone(),
        registry.clone(),
        Notifier::disabled(),
        environment,
    )
}

async fn seed_purchase(
    db: &SettlementDb,
    destination: Option<(&str, &str, &str)>,
    is_ai: bool,
    amount: Decimal,
) -> (i64, i64) {
    let tip_id = db
        .insert_tip(41, "Jess Wanjiku", destination, is_ai)
        .await
        .unwrap();
    let purchase_id = db
        .insert_purchase(
            tip_id,
            "buyer@example.com",
            "Amos Otieno",
            Some("254700111222"),
            amount,
            "KES",
        )
        .await
        .unwrap();
    (tip_id, purchase_id)
}

async fn seed_payment(db: &SettlementDb, purchase_id: i64, amount: Decimal) -> Payment {
    seed_payment_at(db, purchase_id, amount, Utc::now()).await
}

async fn seed_payment_at(
    db: &SettlementDb,
    purchase_id: i64,
    amount: Decimal,
    created_at: DateTime<Utc>,
) -> Payment {
    let new = NewPayment {
        reference: format!("PAY-T{}", purchase_id),
        purchase_id,
        kind: PaymentKind::Purchase,
        amount,
        currency: "KES".to_string(),
        gateway_id: "mobipay".to_string(),
        payment_method: "mobile_money".to_string(),
    };
    db.insert_payment(&new, created_at).await.unwrap()
}

fn webhook_body(reference: &str, tx_id: &str, status: &str, amount: &str) -> String {
    serde_json::json!({
        "transaction_id": tx_id,
        "external_ref": reference,
        "status": status,
        "amount": amount,
        "currency": "KES",
        "completed_at": Utc::now().to_rfc3339(),
        "merchant_code": MERCHANT_CODE,
    })
    .to_string()
}

fn sign(body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(API_SECRET.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn signed(body: String) -> RawWebhook {
    let sig = sign(&body);
    RawWebhook::new(body, [("x-mobipay-signature".to_string(), sig)])
}

fn unsigned(body: String) -> RawWebhook {
    RawWebhook::new(body, std::iter::empty::<(String, String)>())
}

// ===== Webhook intake =====

#[tokio::test]
async fn completed_webhook_settles_payment_and_holds_escrow() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(150.00)).await;
    let payment = seed_payment(&db, purchase_id, dec!(150.00)).await;

    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);
    let raw = signed(webhook_body(&payment.reference, "MTX-1", "SUCCESS", "150.00"));

    let ack = proc.process("mobipay", &raw, Utc::now()).await.unwrap();
    assert!(ack.success);
    assert_eq!(ack.status, "completed");

    let payment = db.payment_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.provider_tx_id.as_deref(), Some("MTX-1"));
    assert!(payment.webhook_fingerprint.is_some());

    let purchase = db.purchase_by_id(purchase_id).await.unwrap().unwrap();
    assert_eq!(purchase.status, PurchaseStatus::Completed);

    let escrow = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Held);
    assert_eq!(escrow.amount, dec!(150.00));
}

#[tokio::test]
async fn duplicate_delivery_is_acked_without_reapplying() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(150.00)).await;
    let payment = seed_payment(&db, purchase_id, dec!(150.00)).await;

    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);
    let body = webhook_body(&payment.reference, "MTX-1", "SUCCESS", "150.00");

    let first = proc
        .process("mobipay", &signed(body.clone()), Utc::now())
        .await
        .unwrap();
    assert!(first.success);
    let escrow = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();

    let second = proc
        .process("mobipay", &signed(body), Utc::now())
        .await
        .unwrap();
    assert!(second.success);

    // Still exactly the same escrow, no double hold.
    let after = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();
    assert_eq!(after.id, escrow.id);
    assert_eq!(after.status, EscrowStatus::Held);
}

#[tokio::test]
async fn redelivery_repairs_escrow_missed_after_transition() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(150.00)).await;
    let payment = seed_payment(&db, purchase_id, dec!(150.00)).await;

    // Payment committed completed but the process died before the escrow
    // side effect ran (no fingerprint recorded, as on a sweep crash).
    db.apply_payment_transition(
        payment.id,
        PaymentStatus::Completed,
        Some("MTX-7"),
        Some("SUCCESS"),
        None,
        None,
        None,
        Utc::now(),
    )
    .await
    .unwrap();
    assert!(db.escrow_by_purchase(purchase_id).await.unwrap().is_none());

    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);
    let raw = signed(webhook_body(&payment.reference, "MTX-7", "SUCCESS", "150.00"));
    let ack = proc.process("mobipay", &raw, Utc::now()).await.unwrap();
    assert!(ack.success);

    let escrow = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Held);
    assert_eq!(escrow.amount, dec!(150.00));
}

#[tokio::test]
async fn exact_duplicate_redelivery_also_repairs_escrow() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(150.00)).await;
    let payment = seed_payment(&db, purchase_id, dec!(150.00)).await;

    let completed_at = Utc::now();
    let body = serde_json::json!({
        "transaction_id": "MTX-8",
        "external_ref": payment.reference,
        "status": "SUCCESS",
        "amount": "150.00",
        "currency": "KES",
        "completed_at": completed_at.to_rfc3339(),
        "merchant_code": MERCHANT_CODE,
    })
    .to_string();

    // The first delivery's transition committed with its fingerprint, but
    // the escrow side effect was lost.
    let fp = fingerprint("MTX-8", "SUCCESS", dec!(150.00), Some(completed_at));
    db.apply_payment_transition(
        payment.id,
        PaymentStatus::Completed,
        Some("MTX-8"),
        Some("SUCCESS"),
        None,
        Some(&fp),
        None,
        Utc::now(),
    )
    .await
    .unwrap();
    assert!(db.escrow_by_purchase(purchase_id).await.unwrap().is_none());

    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);
    let ack = proc
        .process("mobipay", &signed(body), Utc::now())
        .await
        .unwrap();
    assert!(ack.success);

    let escrow = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Held);
}

#[tokio::test]
async fn conflicting_status_after_terminal_is_ignored() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(150.00)).await;
    let payment = seed_payment(&db, purchase_id, dec!(150.00)).await;

    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);
    let ack = proc
        .process(
            "mobipay",
            &signed(webhook_body(&payment.reference, "MTX-9", "SUCCESS", "150.00")),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(ack.success);

    // A late FAILED event for the same payment must ack as a no-op without
    // flipping anything.
    let ack = proc
        .process(
            "mobipay",
            &signed(webhook_body(&payment.reference, "MTX-9", "FAILED", "150.00")),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(ack.success);
    assert_eq!(ack.status, "completed");

    let payment = db.payment_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    let purchase = db.purchase_by_id(purchase_id).await.unwrap().unwrap();
    assert_eq!(purchase.status, PurchaseStatus::Completed);
    let escrow = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Held);
}

#[tokio::test]
async fn production_requires_signature_sandbox_does_not() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(80)).await;
    let payment = seed_payment(&db, purchase_id, dec!(80)).await;

    let body = webhook_body(&payment.reference, "MTX-2", "SUCCESS", "80.00");

    let strict = processor(&db, &registry, RuntimeEnv::Production);
    let err = strict
        .process("mobipay", &unsigned(body.clone()), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::MissingSignature));
    let fresh = db.payment_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, PaymentStatus::Pending);

    let lenient = processor(&db, &registry, RuntimeEnv::Sandbox);
    let ack = lenient
        .process("mobipay", &unsigned(body), Utc::now())
        .await
        .unwrap();
    assert!(ack.success);
}

#[tokio::test]
async fn tampered_signature_is_rejected_in_any_environment() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(80)).await;
    let payment = seed_payment(&db, purchase_id, dec!(80)).await;

    let body = webhook_body(&payment.reference, "MTX-3", "SUCCESS", "80.00");
    let raw = RawWebhook::new(
        body,
        [("x-mobipay-signature".to_string(), "bm90LXZhbGlk".to_string())],
    );

    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);
    let err = proc.process("mobipay", &raw, Utc::now()).await.unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSignature));

    let fresh = db.payment_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn amount_mismatch_is_rejected() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(150.00)).await;
    let payment = seed_payment(&db, purchase_id, dec!(150.00)).await;

    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);
    let raw = signed(webhook_body(&payment.reference, "MTX-4", "SUCCESS", "15.00"));

    let err = proc.process("mobipay", &raw, Utc::now()).await.unwrap_err();
    assert!(matches!(err, WebhookError::AmountMismatch { .. }));

    let fresh = db.payment_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, PaymentStatus::Pending);
    assert!(db.escrow_by_purchase(purchase_id).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_payment_reference_is_rejected() {
    let (db, registry) = harness().await;
    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);

    let raw = signed(webhook_body("PAY-NOPE", "MTX-5", "SUCCESS", "10.00"));
    let err = proc.process("mobipay", &raw, Utc::now()).await.unwrap_err();
    assert!(matches!(err, WebhookError::UnknownPayment { .. }));
}

#[tokio::test]
async fn stale_event_is_rejected() {
    let (db, registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(80)).await;
    let payment = seed_payment(&db, purchase_id, dec!(80)).await;

    let body = serde_json::json!({
        "transaction_id": "MTX-6",
        "external_ref": payment.reference,
        "status": "SUCCESS",
        "amount": "80.00",
        "currency": "KES",
        "completed_at": (Utc::now() - Duration::hours(48)).to_rfc3339(),
        "merchant_code": MERCHANT_CODE,
    })
    .to_string();

    let proc = processor(&db, &registry, RuntimeEnv::Sandbox);
    let err = proc
        .process("mobipay", &signed(body), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::StaleEvent { .. }));
}

// ===== Evaluation to outcome to settlement =====

async fn complete_purchase(db: &SettlementDb, payment: &Payment) {
    let notifier = Notifier::disabled();
    let outcome = apply_status_change(
        db,
        &notifier,
        payment,
        PaymentStatus::Completed,
        Some("MTX-SETTLE"),
        Some("SUCCESS"),
        None,
        None,
        None,
        Utc::now(),
    )
    .await
    .unwrap();
    assert!(outcome.was_applied());
}

fn policy() -> SettlementPolicy {
    SettlementPolicy {
        commission_rate: dec!(0.10),
        payout_gateway_id: "mobipay".to_string(),
    }
}

#[tokio::test]
async fn winning_tip_settles_with_commission_split() {
    let (db, registry) = harness().await;
    let (tip_id, purchase_id) =
        seed_purchase(&db, Some(("0011223344", "Jess Wanjiku", "EQBNK")), false, dec!(100)).await;
    let payment = seed_payment(&db, purchase_id, dec!(100)).await;
    complete_purchase(&db, &payment).await;

    let match_id = db
        .insert_match("m-100", "Gor Mahia", "Tusker", Utc::now() - Duration::hours(3))
        .await
        .unwrap();
    db.insert_selection(tip_id, match_id, PredictionType::MatchResult, "home_win", dec!(1.8))
        .await
        .unwrap();
    db.set_match_result(match_id, MatchStatus::Finished, Some(2), Some(0))
        .await
        .unwrap();

    run_selection_evaluation(&db).await.unwrap();
    let outcome = run_tip_outcome(&db, Utc::now()).await.unwrap();
    assert_eq!(outcome.won, 1);
    let tip = db.tip_by_id(tip_id).await.unwrap().unwrap();
    assert_eq!(tip.status, TipStatus::Won);

    let stats = run_escrow_settlement(&db, &registry, &policy(), Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.released, 1);

    let escrow = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Released);
    assert_eq!(escrow.release_type, Some(ReleaseType::TipsterPayout));
    assert_eq!(escrow.platform_fee, dec!(10.00));
    assert_eq!(escrow.tipster_earnings, dec!(90.00));

    // Transfer initiation fails against the unroutable gateway, but the
    // payout row exists and stays pending for reconciliation.
    let payments = db.payments_for_purchase(purchase_id).await.unwrap();
    let payout = payments
        .iter()
        .find(|p| p.kind == PaymentKind::Payout)
        .expect("payout payment created");
    assert_eq!(payout.amount, dec!(90.00));
    assert_eq!(payout.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn winning_ai_tip_is_retained_as_platform_revenue() {
    let (db, registry) = harness().await;
    let (tip_id, purchase_id) = seed_purchase(&db, None, true, dec!(100)).await;
    let payment = seed_payment(&db, purchase_id, dec!(100)).await;
    complete_purchase(&db, &payment).await;

    let match_id = db
        .insert_match("m-101", "Arsenal", "Spurs", Utc::now() - Duration::hours(3))
        .await
        .unwrap();
    db.insert_selection(tip_id, match_id, PredictionType::MatchResult, "draw", dec!(3.2))
        .await
        .unwrap();
    db.set_match_result(match_id, MatchStatus::Finished, Some(1), Some(1))
        .await
        .unwrap();

    run_selection_evaluation(&db).await.unwrap();
    run_tip_outcome(&db, Utc::now()).await.unwrap();

    let stats = run_escrow_settlement(&db, &registry, &policy(), Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.platform_revenue, 1);

    let escrow = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Released);
    assert_eq!(escrow.release_type, Some(ReleaseType::PlatformRevenue));
    assert_eq!(escrow.platform_fee, dec!(100));
    assert_eq!(escrow.tipster_earnings, dec!(0));

    // No money leaves the platform.
    let payments = db.payments_for_purchase(purchase_id).await.unwrap();
    assert!(payments.iter().all(|p| p.kind == PaymentKind::Purchase));

    let ledger = db.platform_ledger_entries(escrow.id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].1, dec!(100));
}

#[tokio::test]
async fn void_tip_refunds_the_buyer_in_full() {
    let (db, registry) = harness().await;
    let (tip_id, purchase_id) = seed_purchase(&db, None, false, dec!(250.50)).await;
    let payment = seed_payment(&db, purchase_id, dec!(250.50)).await;
    complete_purchase(&db, &payment).await;

    let match_id = db
        .insert_match("m-102", "Yanga", "Simba", Utc::now() - Duration::hours(3))
        .await
        .unwrap();
    db.insert_selection(tip_id, match_id, PredictionType::MatchResult, "home_win", dec!(2.1))
        .await
        .unwrap();
    db.set_match_result(match_id, MatchStatus::Cancelled, None, None)
        .await
        .unwrap();

    run_selection_evaluation(&db).await.unwrap();
    let outcome = run_tip_outcome(&db, Utc::now()).await.unwrap();
    assert_eq!(outcome.voided, 1);

    let stats = run_escrow_settlement(&db, &registry, &policy(), Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.refunded, 1);

    let escrow = db.escrow_by_purchase(purchase_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Refunded);
    assert_eq!(escrow.release_type, Some(ReleaseType::BuyerRefund));
    assert_eq!(escrow.platform_fee, dec!(0));

    let payments = db.payments_for_purchase(purchase_id).await.unwrap();
    let refund = payments
        .iter()
        .find(|p| p.kind == PaymentKind::Refund)
        .expect("refund payment created");
    assert_eq!(refund.amount, dec!(250.50));
}

#[tokio::test]
async fn settlement_is_idempotent_across_runs() {
    let (db, registry) = harness().await;
    let (tip_id, purchase_id) = seed_purchase(&db, None, false, dec!(60)).await;
    let payment = seed_payment(&db, purchase_id, dec!(60)).await;
    complete_purchase(&db, &payment).await;

    let match_id = db
        .insert_match("m-103", "Leeds", "Derby", Utc::now() - Duration::hours(3))
        .await
        .unwrap();
    db.insert_selection(tip_id, match_id, PredictionType::MatchResult, "away_win", dec!(4.0))
        .await
        .unwrap();
    db.set_match_result(match_id, MatchStatus::Finished, Some(3), Some(0))
        .await
        .unwrap();

    run_selection_evaluation(&db).await.unwrap();
    run_tip_outcome(&db, Utc::now()).await.unwrap();

    let first = run_escrow_settlement(&db, &registry, &policy(), Utc::now())
        .await
        .unwrap();
    assert_eq!(first.refunded, 1);

    let second = run_escrow_settlement(&db, &registry, &policy(), Utc::now())
        .await
        .unwrap();
    assert_eq!(second.examined, 0);

    let payments = db.payments_for_purchase(purchase_id).await.unwrap();
    let refunds = payments.iter().filter(|p| p.kind == PaymentKind::Refund).count();
    assert_eq!(refunds, 1);
}

#[tokio::test]
async fn tip_outcome_waits_for_every_leg() {
    let (db, _registry) = harness().await;
    let (tip_id, purchase_id) = seed_purchase(&db, None, false, dec!(40)).await;
    let payment = seed_payment(&db, purchase_id, dec!(40)).await;
    complete_purchase(&db, &payment).await;

    let finished = db
        .insert_match("m-104", "Chelsea", "Fulham", Utc::now() - Duration::hours(3))
        .await
        .unwrap();
    let upcoming = db
        .insert_match("m-105", "Ajax", "PSV", Utc::now() + Duration::hours(3))
        .await
        .unwrap();
    db.insert_selection(tip_id, finished, PredictionType::MatchResult, "home_win", dec!(1.5))
        .await
        .unwrap();
    db.insert_selection(tip_id, upcoming, PredictionType::MatchResult, "home_win", dec!(2.0))
        .await
        .unwrap();
    db.set_match_result(finished, MatchStatus::Finished, Some(1), Some(0))
        .await
        .unwrap();

    run_selection_evaluation(&db).await.unwrap();
    let partial = run_tip_outcome(&db, Utc::now()).await.unwrap();
    assert_eq!(partial.undetermined, 1);
    let tip = db.tip_by_id(tip_id).await.unwrap().unwrap();
    assert_eq!(tip.status, TipStatus::Pending);

    db.set_match_result(upcoming, MatchStatus::Finished, Some(2), Some(1))
        .await
        .unwrap();
    run_selection_evaluation(&db).await.unwrap();
    let full = run_tip_outcome(&db, Utc::now()).await.unwrap();
    assert_eq!(full.won, 1);

    let tip = db.tip_by_id(tip_id).await.unwrap().unwrap();
    assert_eq!(tip.status, TipStatus::Won);
    let purchase = db.purchase_by_id(purchase_id).await.unwrap().unwrap();
    assert_eq!(purchase.tip_outcome, Some(TipStatus::Won));
}

// ===== Persistence =====

#[tokio::test]
async fn database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tipflow.db");
    let path = path.to_str().unwrap();

    let tip_id = {
        let db = SettlementDb::new(path).unwrap();
        db.insert_tip(7, "Persistent Pundit", None, false)
            .await
            .unwrap()
    };

    let db = SettlementDb::new(path).unwrap();
    let tip = db.tip_by_id(tip_id).await.unwrap().unwrap();
    assert_eq!(tip.tipster_name, "Persistent Pundit");
    assert_eq!(tip.status, TipStatus::Pending);
}

// ===== Reconciliation =====

/// Disbursement gateway whose transfers never leave PROCESSING.
struct SlowTransferGateway;

#[async_trait::async_trait]
impl PaymentGateway for SlowTransferGateway {
    fn id(&self) -> &'static str {
        "slowpay"
    }

    fn supported_methods(&self) -> &'static [&'static str] {
        &["bank_transfer"]
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["KES"]
    }

    fn handling_mode(&self, _method: &str) -> HandlingMode {
        HandlingMode::Direct
    }

    fn map_status(&self, provider_status: &str) -> PaymentStatus {
        match provider_status {
            "SUCCESS" => PaymentStatus::Completed,
            "FAILED" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }

    async fn initiate_payment(&self, _request: &PaymentRequest) -> anyhow::Result<PaymentResponse> {
        Ok(PaymentResponse::failure("unsupported", "collections not supported"))
    }

    async fn check_payment_status(&self, provider_tx_id: &str) -> anyhow::Result<StatusCheck> {
        Ok(StatusCheck::Reported(ProviderPaymentState {
            provider_tx_id: Some(provider_tx_id.to_string()),
            provider_status: "PROCESSING".to_string(),
            raw: None,
        }))
    }

    fn parse_webhook(&self, _raw: &RawWebhook) -> Result<WebhookEvent, WebhookError> {
        Err(WebhookError::InvalidPayload("no webhooks".to_string()))
    }

    async fn initiate_transfer(&self, _request: &PayoutRequest) -> anyhow::Result<PaymentResponse> {
        Ok(PaymentResponse {
            success: true,
            provider_tx_id: Some("TR-NEW".to_string()),
            status: "PROCESSING".to_string(),
            redirect_url: None,
            errors: Vec::new(),
        })
    }
}

#[tokio::test]
async fn payout_sweep_polls_initiated_transfers_without_spending_retries() {
    let db = SettlementDb::open_in_memory().unwrap();
    let registry = GatewayRegistry::build(
        vec![Arc::new(SlowTransferGateway) as Arc<dyn PaymentGateway>],
        &db,
    )
    .await
    .unwrap();

    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(90)).await;
    let payout = db
        .insert_payment(
            &NewPayment {
                reference: "PO-SLOW".to_string(),
                purchase_id,
                kind: PaymentKind::Payout,
                amount: dec!(90),
                currency: "KES".to_string(),
                gateway_id: "slowpay".to_string(),
                payment_method: "bank_transfer".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    db.record_initiation(payout.id, Some("TR-1"), Some("PROCESSING"), None, Utc::now())
        .await
        .unwrap();

    // A healthy-but-slow provider gets polled indefinitely; the retry
    // budget is reserved for initiation attempts.
    for _ in 0..3 {
        let stats = run_payout_sweep(&db, &registry, 3, Utc::now()).await.unwrap();
        assert_eq!(stats.examined, 1);
        assert_eq!(stats.skipped, 1);
    }

    let payout = db.payment_by_id(payout.id).await.unwrap().unwrap();
    assert_eq!(payout.status, PaymentStatus::Pending);
    assert_eq!(payout.retry_count, 0);

    let stats = run_payout_sweep(&db, &registry, 3, Utc::now()).await.unwrap();
    assert_eq!(stats.examined, 1);
}

#[tokio::test]
async fn refund_completion_does_not_cascade_to_the_purchase() {
    let db = SettlementDb::open_in_memory().unwrap();
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(50)).await;

    let refund = db
        .insert_payment(
            &NewPayment {
                reference: "RF-CASCADE".to_string(),
                purchase_id,
                kind: PaymentKind::Refund,
                amount: dec!(50),
                currency: "KES".to_string(),
                gateway_id: "mobipay".to_string(),
                payment_method: "mobile_money".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();

    let outcome = db
        .apply_payment_transition(
            refund.id,
            PaymentStatus::Completed,
            Some("TR-2"),
            Some("SUCCESS"),
            None,
            None,
            None,
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(outcome.was_applied());

    // Only collection payments drive the purchase state machine.
    let purchase = db.purchase_by_id(purchase_id).await.unwrap().unwrap();
    assert_eq!(purchase.status, PurchaseStatus::Pending);
}

#[tokio::test]
async fn cleanup_sweep_times_out_stale_pending_payments() {
    let (db, _registry) = harness().await;
    let (_tip, purchase_id) = seed_purchase(&db, None, false, dec!(75)).await;
    let stale = seed_payment_at(&db, purchase_id, dec!(75), Utc::now() - Duration::hours(48)).await;

    let stats = run_cleanup_sweep(&db, &Notifier::disabled(), 24, Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);

    let payment = db.payment_by_id(stale.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_reason.as_deref(), Some("timeout"));

    let purchase = db.purchase_by_id(purchase_id).await.unwrap().unwrap();
    assert_eq!(purchase.status, PurchaseStatus::Failed);
}
