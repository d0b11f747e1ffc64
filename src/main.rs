//! Tipflow settlement backend
//!
//! HTTP intake (payment initiation + gateway webhooks) plus the scheduled
//! reconciliation, evaluation and escrow settlement loops, all sharing one
//! SQLite-backed datastore.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tipflow_backend::api::create_router;
use tipflow_backend::gateway::registry::GatewayRegistry;
use tipflow_backend::models::Config;
use tipflow_backend::notify::Notifier;
use tipflow_backend::schedulers::{self, SchedulerSettings, SettlementPolicy};
use tipflow_backend::store::SettlementDb;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let config = Config::from_env()?;
    info!(
        environment = ?config.environment,
        db_path = %config.database_path,
        "🚀 Tipflow settlement backend starting"
    );

    let db = SettlementDb::new(&config.database_path)
        .context("Failed to open settlement database")?;

    let adapters = GatewayRegistry::adapters_from_env();
    if adapters.is_empty() {
        anyhow::bail!("no payment gateway credentials configured");
    }
    let registry = GatewayRegistry::build(adapters, &db)
        .await
        .context("Failed to build gateway registry")?;
    info!(gateways = ?registry.gateway_ids(), "gateway registry ready");

    let notifier = Notifier::new(
        config.notification_base_url.clone(),
        config.admin_webhook_url.clone(),
    );

    let policy = SettlementPolicy::from_config(&config);
    schedulers::spawn_all(
        db.clone(),
        registry.clone(),
        notifier.clone(),
        policy,
        SchedulerSettings::from_env(),
    );

    let app = create_router(db, Arc::clone(&registry), notifier, config.environment)
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tipflow_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
