//! Story entitlement domain (trial credits, subscriptions, paywall gating).
//!
//! The [`EntitlementLedger`] owns one family's [`Subscription`] record and is the
//! only writer of it. Persistence and purchasing are collaborators behind the
//! [`KeyValueStore`] and [`PurchaseProvider`] traits.

pub mod catalog;
pub mod config;
pub mod ledger;
pub mod outcome;
pub mod purchase;
pub mod store;
pub mod subscription;

pub use catalog::{CheckoutRequest, Product};
pub use config::{LedgerConfig, Platform};
pub use ledger::EntitlementLedger;
pub use outcome::{ConsumeOutcome, LedgerError, PurchaseOutcome, RestoreOutcome};
pub use purchase::{
    PurchaseError, PurchaseProvider, PurchaseResult, RestoredEntitlement,
    ScriptedPurchaseProvider, TransactionInfo, UnsupportedPurchaseProvider,
};
pub use store::{InMemoryStore, KeyValueStore, StoreError};
pub use subscription::{
    ACTIVE_STORY_ALLOTMENT, DEFAULT_TRIAL_STORY_LIMIT, Subscription, SubscriptionStatus,
};
