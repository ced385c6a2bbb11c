//! Purchase provider seam (platform store or web checkout).
//!
//! Providers report what happened in the external purchase flow; they never
//! touch the subscription record themselves.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::Product;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub product: Product,
    pub purchased_at: DateTime<Utc>,
}

/// Result of a purchase flow that ran to an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseResult {
    Completed(TransactionInfo),
    /// The user backed out of the store dialog.
    Cancelled,
    Declined { reason: String },
}

/// An entitlement found in the platform's purchase history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredEntitlement {
    pub product: Product,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PurchaseError {
    #[error("purchases are not available on this platform")]
    Unavailable,

    #[error("purchase provider failed: {0}")]
    Provider(String),
}

#[async_trait::async_trait]
pub trait PurchaseProvider: Send + Sync {
    async fn purchase(&self, product: Product) -> Result<PurchaseResult, PurchaseError>;

    async fn restore(&self) -> Result<Vec<RestoredEntitlement>, PurchaseError>;
}

/// Provider for builds without a store integration.
///
/// Purchases are unavailable and there is never any history to restore.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedPurchaseProvider;

#[async_trait::async_trait]
impl PurchaseProvider for UnsupportedPurchaseProvider {
    async fn purchase(&self, product: Product) -> Result<PurchaseResult, PurchaseError> {
        tracing::debug!(product_id = %product, "no store integration; purchase unavailable");
        Err(PurchaseError::Unavailable)
    }

    async fn restore(&self) -> Result<Vec<RestoredEntitlement>, PurchaseError> {
        Ok(Vec::new())
    }
}

/// Provider that replays queued purchase results.
///
/// With an empty queue every purchase completes. Intended for tests and sandbox runs.
#[derive(Debug, Default)]
pub struct ScriptedPurchaseProvider {
    purchases: Mutex<VecDeque<Result<PurchaseResult, PurchaseError>>>,
    history: Mutex<Vec<RestoredEntitlement>>,
    purchase_calls: AtomicUsize,
    restore_calls: AtomicUsize,
}

impl ScriptedPurchaseProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_purchase(&self, result: Result<PurchaseResult, PurchaseError>) {
        let mut queue = self.purchases.lock().unwrap_or_else(|p| p.into_inner());
        queue.push_back(result);
    }

    pub fn with_history(history: Vec<RestoredEntitlement>) -> Self {
        Self {
            history: Mutex::new(history),
            ..Self::default()
        }
    }

    pub fn purchase_calls(&self) -> usize {
        self.purchase_calls.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PurchaseProvider for ScriptedPurchaseProvider {
    async fn purchase(&self, product: Product) -> Result<PurchaseResult, PurchaseError> {
        self.purchase_calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut queue = self.purchases.lock().unwrap_or_else(|p| p.into_inner());
            queue.pop_front()
        };
        next.unwrap_or_else(|| {
            Ok(PurchaseResult::Completed(TransactionInfo {
                transaction_id: Uuid::now_v7().to_string(),
                product,
                purchased_at: Utc::now(),
            }))
        })
    }

    async fn restore(&self) -> Result<Vec<RestoredEntitlement>, PurchaseError> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        Ok(history.clone())
    }
}
