//! Gateway registry
//!
//! Immutable-after-build snapshot mapping logical gateway ids to live
//! adapter instances plus their persisted configuration. A config refresh
//! builds a whole new snapshot and swaps it in; readers never observe a
//! half-built map and keep serving last-known-good during a rebuild.

use super::{flexcard::FlexcardGateway, mobipay::MobipayGateway, paystar::PaystarGateway};
use super::PaymentGateway;
use crate::models::HandlingMode;
use crate::store::SettlementDb;
use anyhow::Result;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Persisted per-gateway configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigRecord {
    pub gateway_id: String,
    pub status: String,
    pub supported_methods: Vec<String>,
    /// method -> "checkout_url" | "direct"
    pub method_handling: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayHealth {
    Active,
    Inactive,
    Maintenance,
}

impl GatewayHealth {
    fn parse_lenient(raw: &str, gateway_id: &str) -> Self {
        match raw {
            "active" => GatewayHealth::Active,
            "inactive" => GatewayHealth::Inactive,
            "maintenance" => GatewayHealth::Maintenance,
            other => {
                warn!(
                    gateway = gateway_id,
                    status = other,
                    "unknown gateway status in config, treating as inactive"
                );
                GatewayHealth::Inactive
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayHealth::Active => "active",
            GatewayHealth::Inactive => "inactive",
            GatewayHealth::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown gateway '{0}'")]
    UnknownGateway(String),

    #[error("gateway '{gateway}' is {status}")]
    GatewayUnavailable { gateway: String, status: String },

    #[error("gateway '{gateway}' does not support payment method '{method}'")]
    UnsupportedMethod { gateway: String, method: String },

    #[error("gateway '{gateway}' does not support currency '{currency}'")]
    UnsupportedCurrency { gateway: String, currency: String },
}

struct GatewayEntry {
    adapter: Arc<dyn PaymentGateway>,
    health: GatewayHealth,
    methods: Vec<String>,
    handling: HashMap<String, HandlingMode>,
}

#[derive(Default)]
struct RegistrySnapshot {
    entries: HashMap<String, GatewayEntry>,
}

pub struct GatewayRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    adapters: Vec<Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    /// Build adapters from environment credentials. Providers with no
    /// credentials configured are simply absent from the registry.
    pub fn adapters_from_env() -> Vec<Arc<dyn PaymentGateway>> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("Tipflow/1.0 (Settlement)")
            .build()
            .expect("Failed to create HTTP client");

        let mut adapters: Vec<Arc<dyn PaymentGateway>> = Vec::new();
        if let Some(gw) = PaystarGateway::from_env(client.clone()) {
            adapters.push(Arc::new(gw));
        }
        if let Some(gw) = MobipayGateway::from_env(client.clone()) {
            adapters.push(Arc::new(gw));
        }
        if let Some(gw) = FlexcardGateway::from_env(client) {
            adapters.push(Arc::new(gw));
        }
        adapters
    }

    /// Construct a registry over a fixed adapter set and load its persisted
    /// configuration into the first snapshot.
    pub async fn build(
        adapters: Vec<Arc<dyn PaymentGateway>>,
        db: &SettlementDb,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            adapters,
        });
        registry.refresh(db).await?;
        Ok(registry)
    }

    /// Rebuild the snapshot wholesale from the config store and swap it in.
    pub async fn refresh(&self, db: &SettlementDb) -> Result<()> {
        let records: HashMap<String, GatewayConfigRecord> = db
            .load_gateway_configs()
            .await?
            .into_iter()
            .map(|r| (r.gateway_id.clone(), r))
            .collect();

        let mut entries = HashMap::new();
        for adapter in &self.adapters {
            let id = adapter.id().to_string();
            let entry = match records.get(&id) {
                Some(rec) => {
                    let handling = rec
                        .method_handling
                        .iter()
                        .map(|(m, h)| (m.clone(), HandlingMode::parse_lenient(h)))
                        .collect();
                    GatewayEntry {
                        adapter: adapter.clone(),
                        health: GatewayHealth::parse_lenient(&rec.status, &id),
                        methods: rec.supported_methods.clone(),
                        handling,
                    }
                }
                // No persisted config: the adapter's own defaults apply.
                None => GatewayEntry {
                    adapter: adapter.clone(),
                    health: GatewayHealth::Active,
                    methods: adapter
                        .supported_methods()
                        .iter()
                        .map(|m| m.to_string())
                        .collect(),
                    handling: HashMap::new(),
                },
            };
            entries.insert(id, entry);
        }

        info!(gateways = entries.len(), "gateway registry snapshot rebuilt");
        self.snapshot.store(Arc::new(RegistrySnapshot { entries }));
        Ok(())
    }

    pub fn adapter(&self, gateway_id: &str) -> Option<Arc<dyn PaymentGateway>> {
        self.snapshot
            .load()
            .entries
            .get(gateway_id)
            .map(|e| e.adapter.clone())
    }

    pub fn gateway_ids(&self) -> Vec<String> {
        self.snapshot.load().entries.keys().cloned().collect()
    }

    /// Validate a dispatch before any provider call. Unsupported
    /// combinations are a rejected call, not a silent fallback.
    pub fn validate_dispatch(
        &self,
        gateway_id: &str,
        method: &str,
        currency: &str,
    ) -> Result<HandlingMode, DispatchError> {
        let snapshot = self.snapshot.load();
        let entry = snapshot
            .entries
            .get(gateway_id)
            .ok_or_else(|| DispatchError::UnknownGateway(gateway_id.to_string()))?;

        if entry.health != GatewayHealth::Active {
            return Err(DispatchError::GatewayUnavailable {
                gateway: gateway_id.to_string(),
                status: entry.health.as_str().to_string(),
            });
        }
        if !entry.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return Err(DispatchError::UnsupportedMethod {
                gateway: gateway_id.to_string(),
                method: method.to_string(),
            });
        }
        if !entry
            .adapter
            .supported_currencies()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
        {
            return Err(DispatchError::UnsupportedCurrency {
                gateway: gateway_id.to_string(),
                currency: currency.to_string(),
            });
        }

        Ok(entry
            .handling
            .get(method)
            .copied()
            .unwrap_or_else(|| entry.adapter.handling_mode(method)))
    }
}
