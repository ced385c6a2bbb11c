//! Ledger outcomes and error taxonomy.
//!
//! Business results (no credit, cancelled purchase, ...) are values. Only a
//! persistence problem travels in the `Err` arm of a ledger operation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::Product;
use crate::store::StoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("no story credits left and no active subscription")]
    NotEntitled,

    #[error("in-app purchases are not available on this platform")]
    PurchaseUnavailable,

    #[error("purchase was declined or cancelled")]
    PurchaseDeclinedOrCancelled,

    #[error("another purchase or restore is already in progress")]
    OperationInProgress,

    /// The in-memory record stays authoritative; the write is retried on the
    /// next mutating call.
    #[error("subscription record could not be persisted: {0}")]
    PersistenceFailure(#[from] StoreError),
}

impl LedgerError {
    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            LedgerError::NotEntitled => "You've used your free stories. Subscribe to keep creating.",
            LedgerError::PurchaseUnavailable => {
                "Purchases aren't available here. Continue to checkout on the web."
            }
            LedgerError::PurchaseDeclinedOrCancelled => "No purchase was made.",
            LedgerError::OperationInProgress => "Please wait for the current purchase to finish.",
            LedgerError::PersistenceFailure(_) => {
                "We couldn't save your subscription on this device. We'll retry automatically."
            }
        }
    }

    /// False for device/storage problems.
    pub fn is_entitlement_problem(&self) -> bool {
        !matches!(self, LedgerError::PersistenceFailure(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ConsumeOutcome {
    /// `stories_remaining` is `None` while the subscription is active.
    #[serde(rename_all = "camelCase")]
    Consumed {
        stories_remaining: Option<u32>,
        paywall_reached: bool,
    },
    NotEntitled,
}

impl ConsumeOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, ConsumeOutcome::Consumed { .. })
    }

    pub fn into_result(self) -> Result<Self, LedgerError> {
        match self {
            ConsumeOutcome::Consumed { .. } => Ok(self),
            ConsumeOutcome::NotEntitled => Err(LedgerError::NotEntitled),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum PurchaseOutcome {
    #[serde(rename_all = "camelCase")]
    Activated {
        product: Product,
        expires_at: DateTime<Utc>,
    },
    Unavailable,
    Cancelled,
    Declined,
    InProgress,
}

impl PurchaseOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, PurchaseOutcome::Activated { .. })
    }

    pub fn into_result(self) -> Result<Self, LedgerError> {
        match self {
            PurchaseOutcome::Activated { .. } => Ok(self),
            PurchaseOutcome::Unavailable => Err(LedgerError::PurchaseUnavailable),
            PurchaseOutcome::Cancelled | PurchaseOutcome::Declined => {
                Err(LedgerError::PurchaseDeclinedOrCancelled)
            }
            PurchaseOutcome::InProgress => Err(LedgerError::OperationInProgress),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RestoreOutcome {
    #[serde(rename_all = "camelCase")]
    Restored {
        product: Product,
        expires_at: DateTime<Utc>,
    },
    AlreadyActive,
    NothingToRestore,
    Unavailable,
    InProgress,
}

impl RestoreOutcome {
    /// True only when restore recovered an entitlement.
    pub fn succeeded(&self) -> bool {
        matches!(self, RestoreOutcome::Restored { .. })
    }

    pub fn into_result(self) -> Result<Self, LedgerError> {
        match self {
            RestoreOutcome::Restored { .. }
            | RestoreOutcome::AlreadyActive
            | RestoreOutcome::NothingToRestore => Ok(self),
            RestoreOutcome::Unavailable => Err(LedgerError::PurchaseUnavailable),
            RestoreOutcome::InProgress => Err(LedgerError::OperationInProgress),
        }
    }
}
