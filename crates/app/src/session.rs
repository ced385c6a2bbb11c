//! Session wiring.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use fsv_core::{Clock, SystemClock};
use fsv_entitlements::{
    EntitlementLedger, KeyValueStore, LedgerConfig, PurchaseProvider, ScriptedPurchaseProvider,
    UnsupportedPurchaseProvider,
};
use fsv_infra::{SqliteKeyValueStore, default_store_path};

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub ledger: LedgerConfig,
    pub store_path: PathBuf,
    /// Approve every purchase locally instead of reporting "unavailable".
    pub sandbox_purchases: bool,
}

impl AppSettings {
    /// Read ledger settings plus `FSV_STORE_PATH` and `FSV_SANDBOX_PURCHASES`.
    pub fn from_env() -> anyhow::Result<Self> {
        let store_path = match std::env::var("FSV_STORE_PATH") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => default_store_path()?,
        };

        let sandbox_purchases = std::env::var("FSV_SANDBOX_PURCHASES")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            ledger: LedgerConfig::from_env(),
            store_path,
            sandbox_purchases,
        })
    }
}

/// Everything one app session shares. The ledger lives here, not in a global.
#[derive(Debug, Clone)]
pub struct Session {
    ledger: Arc<EntitlementLedger>,
}

impl Session {
    pub async fn open(settings: &AppSettings) -> anyhow::Result<Self> {
        let store = SqliteKeyValueStore::open_path(&settings.store_path)
            .await
            .with_context(|| format!("failed to open store at {:?}", settings.store_path))?;

        let provider: Arc<dyn PurchaseProvider> = if settings.sandbox_purchases {
            tracing::warn!("sandbox purchases enabled; every purchase is approved locally");
            Arc::new(ScriptedPurchaseProvider::new())
        } else {
            Arc::new(UnsupportedPurchaseProvider)
        };

        Ok(Self::with_parts(
            settings.ledger.clone(),
            Arc::new(store),
            provider,
            Arc::new(SystemClock),
        )
        .await)
    }

    pub async fn with_parts(
        config: LedgerConfig,
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn PurchaseProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        tracing::info!(
            family_id = %config.family_id,
            platform = ?config.platform,
            "opening session"
        );
        let ledger = EntitlementLedger::open(config, store, provider, clock).await;
        Self {
            ledger: Arc::new(ledger),
        }
    }

    pub fn ledger(&self) -> &EntitlementLedger {
        &self.ledger
    }
}
