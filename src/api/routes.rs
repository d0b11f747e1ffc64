use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::gateway::registry::{DispatchError, GatewayRegistry};
use crate::gateway::{CustomerInfo, PaymentRequest, RawWebhook, StatusCheck};
use crate::models::{PaymentKind, PurchaseStatus, RuntimeEnv};
use crate::notify::Notifier;
use crate::store::{NewPayment, SettlementDb};
use crate::webhook::{WebhookError, WebhookProcessor};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: SettlementDb,
    pub registry: Arc<GatewayRegistry>,
    pub processor: Arc<WebhookProcessor>,
}

/// Create the API router
pub fn create_router(
    db: SettlementDb,
    registry: Arc<GatewayRegistry>,
    notifier: Notifier,
    environment: RuntimeEnv,
) -> Router {
    let processor = Arc::new(WebhookProcessor::new(
        db.clone(),
        registry.clone(),
        notifier,
        environment,
    ));
    let state = AppState {
        db,
        registry,
        processor,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/payments/initiate", post(initiate_payment))
        .route("/api/payments/:gateway/status/:tx_id", get(payment_status))
        .route("/api/webhooks/:gateway", post(receive_webhook))
        .route("/api/gateways", get(list_gateways))
        .route("/api/gateways/refresh", post(refresh_gateways))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Open a collection payment for a purchase and hand it to the gateway.
async fn initiate_payment(
    State(state): State<AppState>,
    Json(req): Json<InitiateRequest>,
) -> Result<Json<InitiateResponse>, ApiError> {
    let purchase = state
        .db
        .purchase_by_id(req.purchase_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Purchase {} not found", req.purchase_id)))?;

    if purchase.status != PurchaseStatus::Pending {
        return Err(ApiError::BadRequest(format!(
            "Purchase {} is {}, not payable",
            purchase.id,
            purchase.status.as_str()
        )));
    }

    state
        .registry
        .validate_dispatch(&req.gateway_id, &req.payment_method, &purchase.currency)?;

    let adapter = state
        .registry
        .adapter(&req.gateway_id)
        .ok_or_else(|| ApiError::NotFound(format!("Gateway {} not found", req.gateway_id)))?;

    let new = NewPayment {
        reference: format!("PAY-{}", Uuid::new_v4().simple()),
        purchase_id: purchase.id,
        kind: PaymentKind::Purchase,
        amount: purchase.amount,
        currency: purchase.currency.clone(),
        gateway_id: req.gateway_id.clone(),
        payment_method: req.payment_method.clone(),
    };
    let payment = state.db.insert_payment(&new, chrono::Utc::now()).await?;

    let request = PaymentRequest {
        reference: payment.reference.clone(),
        amount: purchase.amount,
        currency: purchase.currency.clone(),
        payment_method: req.payment_method,
        customer: CustomerInfo {
            email: purchase.buyer_email.clone(),
            name: purchase.buyer_name.clone(),
            phone: purchase.buyer_phone.clone(),
        },
        callback_url: req.callback_url,
    };

    let response = adapter.initiate_payment(&request).await?;
    state
        .db
        .record_initiation(
            payment.id,
            response.provider_tx_id.as_deref(),
            Some(&response.status),
            None,
            chrono::Utc::now(),
        )
        .await?;

    Ok(Json(InitiateResponse {
        success: response.success,
        payment_id: payment.id,
        reference: payment.reference,
        status: response.status,
        redirect_url: response.redirect_url,
        errors: response.errors,
    }))
}

/// Synchronous status pull against the gateway, with our own mapping.
async fn payment_status(
    State(state): State<AppState>,
    Path((gateway_id, tx_id)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, ApiError> {
    let adapter = state
        .registry
        .adapter(&gateway_id)
        .ok_or_else(|| ApiError::NotFound(format!("Gateway {} not found", gateway_id)))?;

    match adapter.check_payment_status(&tx_id).await? {
        StatusCheck::Reported(provider) => Ok(Json(StatusResponse {
            status: adapter.map_status(&provider.provider_status).as_str().to_string(),
            provider_status: provider.provider_status,
            provider_tx_id: provider.provider_tx_id,
        })),
        StatusCheck::NotFound => Err(ApiError::NotFound(format!(
            "Transaction {} not found at {}",
            tx_id, gateway_id
        ))),
    }
}

/// Gateway webhook intake. Always answers with an ack envelope; rejections
/// carry an HTTP error status so the gateway retries only what it should.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let raw = RawWebhook::new(
        body,
        headers.iter().map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        }),
    );

    match state.processor.process(&gateway_id, &raw, chrono::Utc::now()).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(e) => {
            let status = match &e {
                WebhookError::MissingSignature | WebhookError::InvalidSignature => {
                    StatusCode::UNAUTHORIZED
                }
                WebhookError::UnknownGateway(_) | WebhookError::UnknownPayment { .. } => {
                    StatusCode::NOT_FOUND
                }
                WebhookError::Internal(err) => {
                    tracing::error!("Webhook processing error: {}", err);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                _ => StatusCode::BAD_REQUEST,
            };
            let message = if e.is_rejection() {
                e.to_string()
            } else {
                "Internal server error".to_string()
            };
            (
                status,
                Json(json!({
                    "success": false,
                    "status": "rejected",
                    "message": message,
                })),
            )
                .into_response()
        }
    }
}

/// List registered gateway ids
async fn list_gateways(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "gateways": state.registry.gateway_ids() }))
}

/// Reload gateway routing configuration from the database.
async fn refresh_gateways(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.registry.refresh(&state.db).await?;
    Ok(Json(json!({ "refreshed": true })))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct InitiateRequest {
    purchase_id: i64,
    gateway_id: String,
    payment_method: String,
    callback_url: Option<String>,
}

#[derive(Serialize)]
struct InitiateResponse {
    success: bool,
    payment_id: i64,
    reference: String,
    status: String,
    redirect_url: Option<String>,
    errors: Vec<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    provider_status: String,
    provider_tx_id: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Database(anyhow::Error),
    NotFound(String),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Database(err)
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::UnknownGateway(_) => ApiError::NotFound(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Database(err) => {
                tracing::error!("Database error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err = anyhow::anyhow!("Test error");
        let api_err: ApiError = err.into();

        match api_err {
            ApiError::Database(_) => (),
            _ => panic!("Expected Database error"),
        }
    }

    #[test]
    fn dispatch_errors_map_to_client_statuses() {
        let unknown: ApiError = DispatchError::UnknownGateway("nope".to_string()).into();
        assert!(matches!(unknown, ApiError::NotFound(_)));

        let unsupported: ApiError = DispatchError::UnsupportedMethod {
            gateway: "paystar".to_string(),
            method: "cash".to_string(),
        }
        .into();
        assert!(matches!(unsupported, ApiError::BadRequest(_)));
    }
}
