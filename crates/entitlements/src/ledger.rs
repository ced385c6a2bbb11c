//! EntitlementLedger: gates story creation and records purchase outcomes.
//!
//! Concurrency model:
//! - reads (`can_create_story`, `needs_paywall`, `snapshot`) are synchronous and
//!   never wait on IO.
//! - mutating operations hold `write_gate` across read-compute-persist, so two
//!   overlapping calls on one ledger cannot lose an update.
//! - purchase and restore additionally share `purchase_gate`; a second attempt
//!   while one is outstanding is rejected instead of queued.
//! - the persisted write happens before the in-memory record is swapped, so a
//!   count shown after an operation returns reflects what was written.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;

use fsv_core::{Clock, DomainError, DomainResult};

use crate::catalog::Product;
use crate::config::LedgerConfig;
use crate::outcome::{ConsumeOutcome, LedgerError, PurchaseOutcome, RestoreOutcome};
use crate::purchase::{PurchaseError, PurchaseProvider, PurchaseResult};
use crate::store::{KeyValueStore, StoreError};
use crate::subscription::{Subscription, SubscriptionStatus};

#[derive(Debug, Clone)]
struct LedgerState {
    record: Subscription,
    /// False until the store has been read successfully or written once.
    loaded: bool,
    /// The in-memory record differs from what the store holds.
    unflushed: bool,
}

/// Owns one family's subscription record.
///
/// Construct one per session at the composition root and share it by reference
/// (or `Arc`) with whatever needs entitlement checks.
pub struct EntitlementLedger {
    config: LedgerConfig,
    store: Arc<dyn KeyValueStore>,
    provider: Arc<dyn PurchaseProvider>,
    clock: Arc<dyn Clock>,
    state: RwLock<LedgerState>,
    write_gate: Mutex<()>,
    purchase_gate: Mutex<()>,
}

impl core::fmt::Debug for EntitlementLedger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntitlementLedger")
            .field("config", &self.config)
            .field("state", &*self.read_state())
            .finish_non_exhaustive()
    }
}

impl EntitlementLedger {
    /// Open the ledger and load the persisted record.
    ///
    /// Never fails: a missing or unusable record starts a fresh trial. A store
    /// that cannot be read leaves the ledger unloaded; the next mutating call
    /// retries the read and refuses to write until it succeeds.
    pub async fn open(
        config: LedgerConfig,
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn PurchaseProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let initial = LedgerState {
            record: Subscription::trial(config.trial_story_limit),
            loaded: false,
            unflushed: false,
        };
        let ledger = Self {
            config,
            store,
            provider,
            clock,
            state: RwLock::new(initial),
            write_gate: Mutex::new(()),
            purchase_gate: Mutex::new(()),
        };
        // Unloaded ledgers retry in `ensure_loaded`.
        let _ = ledger.load().await;
        ledger
    }

    /// Effective record at the current time (lapsed subscriptions read as expired).
    pub fn snapshot(&self) -> Subscription {
        self.read_state().record.effective_at(self.clock.now())
    }

    pub fn can_create_story(&self) -> bool {
        self.snapshot().can_create_story()
    }

    /// Check before starting story generation, so no external work is spent on
    /// a request the ledger would refuse.
    pub fn ensure_can_create_story(&self) -> Result<(), LedgerError> {
        if self.can_create_story() {
            Ok(())
        } else {
            Err(LedgerError::NotEntitled)
        }
    }

    pub fn needs_paywall(&self) -> bool {
        self.snapshot().needs_paywall()
    }

    /// Stories left for display; `None` while unlimited.
    pub fn remaining_credits(&self) -> Option<u32> {
        self.snapshot().remaining_credits()
    }

    /// True when the last write failed and the store is behind memory.
    pub fn has_unflushed_changes(&self) -> bool {
        self.read_state().unflushed
    }

    /// Spend one story credit. Call only after the story was generated.
    ///
    /// On `Err(PersistenceFailure(StoreError::Write))` the credit is already
    /// spent in memory. On `StoreError::Read` nothing was spent: the stored
    /// record could not be read, so there is nothing safe to decrement.
    pub async fn consume_story(&self) -> Result<ConsumeOutcome, LedgerError> {
        let _write = self.write_gate.lock().await;
        self.ensure_loaded().await?;

        let current = self.current_record();
        let Some(next) = current.consumed() else {
            tracing::warn!(
                family_id = %self.config.family_id,
                status = %current.status,
                "story consumption refused; no credit left"
            );
            self.flush_pending(current).await;
            return Ok(ConsumeOutcome::NotEntitled);
        };

        let outcome = ConsumeOutcome::Consumed {
            stories_remaining: next.remaining_credits(),
            paywall_reached: next.needs_paywall(),
        };
        let stories_remaining = next.stories_remaining;
        let paywall_reached = next.needs_paywall();

        self.commit(next).await?;

        tracing::info!(
            family_id = %self.config.family_id,
            stories_remaining,
            "story credit consumed"
        );
        if paywall_reached {
            tracing::info!(family_id = %self.config.family_id, "trial exhausted; paywall due");
        }

        Ok(outcome)
    }

    /// Record the outcome of an in-app purchase of `product`.
    pub async fn purchase_subscription(
        &self,
        product: Product,
    ) -> Result<PurchaseOutcome, LedgerError> {
        if !self.config.platform.supports_in_app_purchases() {
            tracing::info!(
                family_id = %self.config.family_id,
                product_id = %product,
                "in-app purchases not available on this platform"
            );
            return Ok(PurchaseOutcome::Unavailable);
        }

        let Ok(_in_flight) = self.purchase_gate.try_lock() else {
            tracing::warn!(product_id = %product, "purchase rejected; another one is in flight");
            return Ok(PurchaseOutcome::InProgress);
        };

        tracing::info!(family_id = %self.config.family_id, product_id = %product, "purchasing subscription");

        let tx = match self.provider.purchase(product).await {
            Ok(PurchaseResult::Completed(tx)) => tx,
            Ok(PurchaseResult::Cancelled) => {
                tracing::info!(product_id = %product, "purchase cancelled by user");
                return Ok(PurchaseOutcome::Cancelled);
            }
            Ok(PurchaseResult::Declined { reason }) => {
                tracing::info!(product_id = %product, %reason, "purchase declined");
                return Ok(PurchaseOutcome::Declined);
            }
            Err(PurchaseError::Unavailable) => {
                tracing::info!(product_id = %product, "purchase provider unavailable");
                return Ok(PurchaseOutcome::Unavailable);
            }
            Err(err) => {
                tracing::warn!(product_id = %product, %err, "purchase provider failed");
                return Ok(PurchaseOutcome::Declined);
            }
        };

        let _write = self.write_gate.lock().await;
        let expires_at = self.clock.now() + product.entitlement_period();
        self.commit(Subscription::activated_until(product, expires_at))
            .await?;

        tracing::info!(
            family_id = %self.config.family_id,
            product_id = %product,
            transaction_id = %tx.transaction_id,
            %expires_at,
            "subscription activated"
        );

        Ok(PurchaseOutcome::Activated {
            product,
            expires_at,
        })
    }

    /// Recover an entitlement from the platform purchase history.
    ///
    /// Never downgrades: an already-active record is left exactly as it is.
    pub async fn restore_purchases(&self) -> Result<RestoreOutcome, LedgerError> {
        if !self.config.platform.supports_in_app_purchases() {
            tracing::info!(family_id = %self.config.family_id, "restore not available on this platform");
            return Ok(RestoreOutcome::Unavailable);
        }

        let Ok(_in_flight) = self.purchase_gate.try_lock() else {
            tracing::warn!("restore rejected; a purchase or restore is in flight");
            return Ok(RestoreOutcome::InProgress);
        };

        {
            let _write = self.write_gate.lock().await;
            self.ensure_loaded().await?;
            if self.current_record().status == SubscriptionStatus::Active {
                tracing::info!(family_id = %self.config.family_id, "restore skipped; already active");
                return Ok(RestoreOutcome::AlreadyActive);
            }
        }

        tracing::info!(family_id = %self.config.family_id, "restoring purchases");

        let history = match self.provider.restore().await {
            Ok(history) => history,
            Err(PurchaseError::Unavailable) => return Ok(RestoreOutcome::Unavailable),
            Err(err) => {
                tracing::warn!(%err, "restore failed");
                return Ok(RestoreOutcome::NothingToRestore);
            }
        };

        let now = self.clock.now();
        let Some(best) = history
            .into_iter()
            .filter(|e| e.expires_at > now)
            .max_by_key(|e| e.expires_at)
        else {
            tracing::info!(family_id = %self.config.family_id, "no purchases to restore");
            return Ok(RestoreOutcome::NothingToRestore);
        };

        let _write = self.write_gate.lock().await;
        if self.current_record().status == SubscriptionStatus::Active {
            return Ok(RestoreOutcome::AlreadyActive);
        }
        self.commit(Subscription::activated_until(best.product, best.expires_at))
            .await?;

        tracing::info!(
            family_id = %self.config.family_id,
            product_id = %best.product,
            expires_at = %best.expires_at,
            "subscription restored"
        );

        Ok(RestoreOutcome::Restored {
            product: best.product,
            expires_at: best.expires_at,
        })
    }
}

impl EntitlementLedger {
    fn read_state(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Record with any lapse applied. Callers hold `write_gate`.
    fn current_record(&self) -> Subscription {
        let stored = self.read_state().record.clone();
        let current = stored.effective_at(self.clock.now());
        if current != stored {
            tracing::info!(
                family_id = %self.config.family_id,
                expires_at = ?stored.expires_at,
                "subscription lapsed; marking expired"
            );
        }
        current
    }

    async fn load(&self) -> Result<(), StoreError> {
        let key = self.config.storage_key.as_str();
        match self.store.get(key).await {
            Ok(Some(raw)) => match parse_record(&raw) {
                Ok(record) => {
                    tracing::info!(
                        family_id = %self.config.family_id,
                        status = %record.status,
                        stories_remaining = record.stories_remaining,
                        "subscription loaded"
                    );
                    let mut state = self.write_state();
                    state.record = record;
                    state.loaded = true;
                    state.unflushed = false;
                    Ok(())
                }
                Err(err) => {
                    tracing::warn!(
                        family_id = %self.config.family_id,
                        %err,
                        "persisted subscription unusable; resetting to trial"
                    );
                    self.reset_to_trial().await;
                    Ok(())
                }
            },
            Ok(None) => {
                tracing::info!(family_id = %self.config.family_id, "no subscription record; starting trial");
                self.reset_to_trial().await;
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    family_id = %self.config.family_id,
                    %err,
                    "failed to read subscription; using in-memory record"
                );
                Err(err)
            }
        }
    }

    async fn reset_to_trial(&self) {
        let trial = Subscription::trial(self.config.trial_story_limit);
        if let Err(err) = self.commit(trial).await {
            tracing::warn!(%err, "initial subscription write deferred");
        }
    }

    /// Callers hold `write_gate`. Until a read succeeds the in-memory record
    /// is a placeholder and must not be written over the stored one.
    async fn ensure_loaded(&self) -> Result<(), LedgerError> {
        let loaded = self.read_state().loaded;
        if loaded {
            return Ok(());
        }
        self.load().await.map_err(|err| {
            tracing::warn!(
                family_id = %self.config.family_id,
                "mutation refused; stored subscription could not be read"
            );
            LedgerError::PersistenceFailure(err)
        })
    }

    /// Retry a deferred write (or persist a lapse) on a path that changes nothing else.
    async fn flush_pending(&self, current: Subscription) {
        let pending = {
            let state = self.read_state();
            state.unflushed || state.record != current
        };
        if pending {
            if let Err(err) = self.commit(current).await {
                tracing::warn!(%err, "deferred subscription write failed again");
            }
        }
    }

    /// Persist `next`, then make it the in-memory record whether or not the
    /// write succeeded.
    async fn commit(&self, next: Subscription) -> Result<(), LedgerError> {
        let written = match serde_json::to_string(&next) {
            Ok(payload) => self.store.set(&self.config.storage_key, &payload).await,
            Err(err) => Err(StoreError::Write(err.to_string())),
        };

        {
            let mut state = self.write_state();
            state.record = next;
            state.loaded = true;
            state.unflushed = written.is_err();
        }

        written.map_err(|err| {
            tracing::error!(
                family_id = %self.config.family_id,
                %err,
                "failed to persist subscription; keeping in-memory record"
            );
            LedgerError::PersistenceFailure(err)
        })
    }
}

fn parse_record(raw: &str) -> DomainResult<Subscription> {
    let record: Subscription = serde_json::from_str(raw)
        .map_err(|e| DomainError::validation(format!("malformed subscription record: {e}")))?;
    record.validate()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Platform;
    use crate::purchase::{RestoredEntitlement, ScriptedPurchaseProvider, TransactionInfo};
    use crate::store::InMemoryStore;
    use chrono::{DateTime, Duration, Utc};
    use fsv_core::FixedClock;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    const KEY: &str = crate::config::DEFAULT_STORAGE_KEY;

    fn test_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn test_config(platform: Platform) -> LedgerConfig {
        LedgerConfig {
            platform,
            ..LedgerConfig::default()
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        provider: Arc<ScriptedPurchaseProvider>,
        clock: Arc<FixedClock>,
        ledger: EntitlementLedger,
    }

    async fn harness_with(store: InMemoryStore, provider: ScriptedPurchaseProvider, platform: Platform) -> Harness {
        let store = Arc::new(store);
        let provider = Arc::new(provider);
        let clock = Arc::new(FixedClock::new(test_time()));
        let ledger = EntitlementLedger::open(
            test_config(platform),
            store.clone(),
            provider.clone(),
            clock.clone(),
        )
        .await;
        Harness {
            store,
            provider,
            clock,
            ledger,
        }
    }

    async fn harness() -> Harness {
        harness_with(InMemoryStore::new(), ScriptedPurchaseProvider::new(), Platform::Ios).await
    }

    fn stored_record(store: &InMemoryStore) -> Subscription {
        serde_json::from_str(&store.raw(KEY).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn first_open_persists_default_trial() {
        let h = harness().await;
        assert_eq!(h.ledger.snapshot(), Subscription::default());
        assert_eq!(stored_record(&h.store), Subscription::default());
        assert!(!h.ledger.has_unflushed_changes());
    }

    #[tokio::test]
    async fn fresh_trial_allows_three_stories_then_refuses() {
        let h = harness().await;

        for _ in 0..3 {
            assert!(h.ledger.can_create_story());
            let outcome = h.ledger.consume_story().await.unwrap();
            assert!(outcome.succeeded());
        }

        let exhausted = h.ledger.snapshot();
        assert_eq!(exhausted.stories_used, 3);
        assert_eq!(exhausted.stories_remaining, 0);
        assert!(!h.ledger.can_create_story());
        assert_eq!(h.ledger.ensure_can_create_story(), Err(LedgerError::NotEntitled));

        let writes_before = h.store.writes();
        let outcome = h.ledger.consume_story().await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::NotEntitled);
        assert_eq!(h.ledger.snapshot(), exhausted);
        assert_eq!(h.store.writes(), writes_before);
        assert_eq!(stored_record(&h.store), exhausted);
    }

    #[tokio::test]
    async fn paywall_is_due_exactly_when_last_credit_is_spent() {
        let h = harness().await;

        h.ledger.consume_story().await.unwrap();
        h.ledger.consume_story().await.unwrap();
        assert!(!h.ledger.needs_paywall());

        let last = h.ledger.consume_story().await.unwrap();
        assert_eq!(
            last,
            ConsumeOutcome::Consumed {
                stories_remaining: Some(0),
                paywall_reached: true,
            }
        );
        assert!(h.ledger.needs_paywall());

        h.ledger
            .purchase_subscription(Product::FamilyYearly)
            .await
            .unwrap();
        assert!(!h.ledger.needs_paywall());
    }

    #[tokio::test]
    async fn yearly_purchase_activates_for_a_year() {
        let h = harness().await;

        let outcome = h
            .ledger
            .purchase_subscription(Product::FamilyYearly)
            .await
            .unwrap();
        let expected_expiry = test_time() + Duration::days(365);
        assert_eq!(
            outcome,
            PurchaseOutcome::Activated {
                product: Product::FamilyYearly,
                expires_at: expected_expiry,
            }
        );

        let sub = h.ledger.snapshot();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.product_id, Some(Product::FamilyYearly));
        assert_eq!(sub.expires_at, Some(expected_expiry));
        assert!(h.ledger.can_create_story());
        assert_eq!(h.ledger.remaining_credits(), None);
        assert_eq!(stored_record(&h.store), sub);
    }

    #[tokio::test]
    async fn active_subscription_consumes_regardless_of_remaining() {
        let mut drained = Subscription::activated(Product::FamilyYearly, test_time());
        drained.stories_remaining = 0;
        let store = InMemoryStore::with_entry(KEY, serde_json::to_string(&drained).unwrap());
        let h = harness_with(store, ScriptedPurchaseProvider::new(), Platform::Android).await;

        for _ in 0..5 {
            let outcome = h.ledger.consume_story().await.unwrap();
            assert_eq!(
                outcome,
                ConsumeOutcome::Consumed {
                    stories_remaining: None,
                    paywall_reached: false,
                }
            );
        }
        assert_eq!(h.ledger.snapshot().stories_used, 5);
        assert_eq!(h.ledger.snapshot().stories_remaining, 0);
    }

    #[tokio::test]
    async fn web_purchase_is_unavailable_and_changes_nothing() {
        let h = harness_with(InMemoryStore::new(), ScriptedPurchaseProvider::new(), Platform::Web).await;

        let outcome = h
            .ledger
            .purchase_subscription(Product::FamilyMonthly)
            .await
            .unwrap();
        assert_eq!(outcome, PurchaseOutcome::Unavailable);
        assert!(!outcome.succeeded());
        assert_eq!(h.provider.purchase_calls(), 0);

        let sub = h.ledger.snapshot();
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(sub.stories_remaining, 3);

        assert_eq!(
            h.ledger.restore_purchases().await.unwrap(),
            RestoreOutcome::Unavailable
        );
    }

    #[tokio::test]
    async fn cancelled_and_declined_purchases_leave_state_untouched() {
        let provider = ScriptedPurchaseProvider::new();
        provider.push_purchase(Ok(PurchaseResult::Cancelled));
        provider.push_purchase(Ok(PurchaseResult::Declined {
            reason: "card declined".to_string(),
        }));
        provider.push_purchase(Err(PurchaseError::Provider("timeout".to_string())));
        let h = harness_with(InMemoryStore::new(), provider, Platform::Ios).await;
        let before = h.ledger.snapshot();

        let outcomes = [
            h.ledger.purchase_subscription(Product::FamilyYearly).await.unwrap(),
            h.ledger.purchase_subscription(Product::FamilyYearly).await.unwrap(),
            h.ledger.purchase_subscription(Product::FamilyYearly).await.unwrap(),
        ];
        assert_eq!(
            outcomes,
            [
                PurchaseOutcome::Cancelled,
                PurchaseOutcome::Declined,
                PurchaseOutcome::Declined,
            ]
        );
        assert_eq!(h.ledger.snapshot(), before);
        assert_eq!(stored_record(&h.store), before);
    }

    #[derive(Default)]
    struct GatedProvider {
        release: Notify,
    }

    #[async_trait::async_trait]
    impl PurchaseProvider for GatedProvider {
        async fn purchase(&self, product: Product) -> Result<PurchaseResult, PurchaseError> {
            self.release.notified().await;
            Ok(PurchaseResult::Completed(TransactionInfo {
                transaction_id: "tx-gated".to_string(),
                product,
                purchased_at: test_time(),
            }))
        }

        async fn restore(&self) -> Result<Vec<RestoredEntitlement>, PurchaseError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn only_one_purchase_may_be_in_flight() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(GatedProvider::default());
        let ledger = EntitlementLedger::open(
            test_config(Platform::Ios),
            store,
            provider.clone(),
            Arc::new(FixedClock::new(test_time())),
        )
        .await;

        let (first, second, restore) = tokio::join!(
            ledger.purchase_subscription(Product::FamilyYearly),
            ledger.purchase_subscription(Product::FamilyMonthly),
            async {
                let outcome = ledger.restore_purchases().await;
                provider.release.notify_one();
                outcome
            },
        );

        assert!(first.unwrap().succeeded());
        assert_eq!(second.unwrap(), PurchaseOutcome::InProgress);
        assert_eq!(restore.unwrap(), RestoreOutcome::InProgress);
        assert_eq!(ledger.snapshot().product_id, Some(Product::FamilyYearly));
    }

    #[tokio::test]
    async fn restore_when_active_does_not_regress() {
        let later = test_time() + Duration::days(900);
        let provider = ScriptedPurchaseProvider::with_history(vec![RestoredEntitlement {
            product: Product::FamilyMonthly,
            expires_at: later,
        }]);
        let h = harness_with(InMemoryStore::new(), provider, Platform::Ios).await;
        h.ledger
            .purchase_subscription(Product::FamilyYearly)
            .await
            .unwrap();
        let active = h.ledger.snapshot();

        for _ in 0..2 {
            assert_eq!(
                h.ledger.restore_purchases().await.unwrap(),
                RestoreOutcome::AlreadyActive
            );
        }
        assert_eq!(h.ledger.snapshot().product_id, active.product_id);
        assert_eq!(h.ledger.snapshot().expires_at, active.expires_at);
        assert_eq!(h.provider.restore_calls(), 0);
    }

    #[tokio::test]
    async fn restore_without_history_reports_nothing() {
        let h = harness().await;
        let before = h.ledger.snapshot();

        let outcome = h.ledger.restore_purchases().await.unwrap();
        assert_eq!(outcome, RestoreOutcome::NothingToRestore);
        assert!(!outcome.succeeded());
        assert_eq!(h.ledger.snapshot(), before);
    }

    #[tokio::test]
    async fn restore_picks_latest_unexpired_entitlement() {
        let provider = ScriptedPurchaseProvider::with_history(vec![
            RestoredEntitlement {
                product: Product::FamilyMonthly,
                expires_at: test_time() - Duration::days(1),
            },
            RestoredEntitlement {
                product: Product::FamilyYearly,
                expires_at: test_time() + Duration::days(200),
            },
            RestoredEntitlement {
                product: Product::FamilyMonthly,
                expires_at: test_time() + Duration::days(10),
            },
        ]);
        let h = harness_with(InMemoryStore::new(), provider, Platform::Ios).await;

        let outcome = h.ledger.restore_purchases().await.unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::Restored {
                product: Product::FamilyYearly,
                expires_at: test_time() + Duration::days(200),
            }
        );
        assert_eq!(h.ledger.snapshot().status, SubscriptionStatus::Active);
        assert_eq!(stored_record(&h.store).product_id, Some(Product::FamilyYearly));
    }

    #[tokio::test]
    async fn malformed_record_resets_to_trial() {
        let store = InMemoryStore::with_entry(KEY, "{not json");
        let h = harness_with(store, ScriptedPurchaseProvider::new(), Platform::Ios).await;
        assert_eq!(h.ledger.snapshot(), Subscription::default());
        assert_eq!(stored_record(&h.store), Subscription::default());
    }

    #[tokio::test]
    async fn record_breaking_invariants_resets_to_trial() {
        let store = InMemoryStore::with_entry(
            KEY,
            r#"{"status":"trial","productId":null,"expiresAt":null,"storiesUsed":0,"storiesRemaining":999,"storiesLimit":3}"#,
        );
        let h = harness_with(store, ScriptedPurchaseProvider::new(), Platform::Ios).await;
        assert_eq!(h.ledger.snapshot().stories_remaining, 3);
        assert!(h.ledger.snapshot().validate().is_ok());
    }

    #[tokio::test]
    async fn lapsed_subscription_reads_expired_and_refuses_stories() {
        let sub = Subscription::activated(Product::FamilyMonthly, test_time());
        let store = InMemoryStore::with_entry(KEY, serde_json::to_string(&sub).unwrap());
        let h = harness_with(store, ScriptedPurchaseProvider::new(), Platform::Ios).await;
        assert!(h.ledger.can_create_story());

        h.clock.advance(Duration::days(30));
        assert_eq!(h.ledger.snapshot().status, SubscriptionStatus::Expired);
        assert!(!h.ledger.can_create_story());
        assert!(!h.ledger.needs_paywall());

        assert_eq!(
            h.ledger.consume_story().await.unwrap(),
            ConsumeOutcome::NotEntitled
        );
        assert_eq!(stored_record(&h.store).status, SubscriptionStatus::Expired);

        let renewed = h
            .ledger
            .purchase_subscription(Product::FamilyMonthly)
            .await
            .unwrap();
        assert!(renewed.succeeded());
        assert!(h.ledger.can_create_story());
    }

    #[tokio::test]
    async fn failed_write_keeps_memory_and_retries_on_next_call() {
        let h = harness().await;
        h.store.set_fail_writes(true);

        let err = h.ledger.consume_story().await.unwrap_err();
        assert!(matches!(err, LedgerError::PersistenceFailure(StoreError::Write(_))));
        assert!(!err.is_entitlement_problem());
        assert_eq!(h.ledger.snapshot().stories_remaining, 2);
        assert!(h.ledger.has_unflushed_changes());
        assert_eq!(stored_record(&h.store).stories_remaining, 3);

        h.store.set_fail_writes(false);
        h.ledger.consume_story().await.unwrap();
        assert!(!h.ledger.has_unflushed_changes());
        let stored = stored_record(&h.store);
        assert_eq!(stored.stories_used, 2);
        assert_eq!(stored.stories_remaining, 1);
    }

    #[tokio::test]
    async fn refused_consumption_still_flushes_a_deferred_write() {
        let h = harness().await;
        h.store.set_fail_writes(true);
        for _ in 0..3 {
            assert!(h.ledger.consume_story().await.is_err());
        }
        h.store.set_fail_writes(false);

        assert_eq!(
            h.ledger.consume_story().await.unwrap(),
            ConsumeOutcome::NotEntitled
        );
        assert!(!h.ledger.has_unflushed_changes());
        assert_eq!(stored_record(&h.store).stories_remaining, 0);
    }

    #[tokio::test]
    async fn unreadable_store_is_reloaded_before_the_next_mutation() {
        let sub = Subscription::activated(Product::FamilyYearly, test_time());
        let store = InMemoryStore::with_entry(KEY, serde_json::to_string(&sub).unwrap());
        store.set_fail_reads(true);
        let h = harness_with(store, ScriptedPurchaseProvider::new(), Platform::Ios).await;

        assert_eq!(h.ledger.snapshot().status, SubscriptionStatus::Trial);
        assert_eq!(h.store.writes(), 0);

        h.store.set_fail_reads(false);
        let outcome = h.ledger.consume_story().await.unwrap();
        assert_eq!(
            outcome,
            ConsumeOutcome::Consumed {
                stories_remaining: None,
                paywall_reached: false,
            }
        );
        assert_eq!(h.ledger.snapshot().product_id, Some(Product::FamilyYearly));
    }

    #[tokio::test]
    async fn persistently_unreadable_store_refuses_mutation_without_writing() {
        let sub = Subscription::activated(Product::FamilyYearly, test_time());
        let store = InMemoryStore::with_entry(KEY, serde_json::to_string(&sub).unwrap());
        store.set_fail_reads(true);
        let h = harness_with(store, ScriptedPurchaseProvider::new(), Platform::Ios).await;

        let err = h.ledger.consume_story().await.unwrap_err();
        assert!(matches!(err, LedgerError::PersistenceFailure(StoreError::Read(_))));
        let err = h.ledger.restore_purchases().await.unwrap_err();
        assert!(matches!(err, LedgerError::PersistenceFailure(StoreError::Read(_))));

        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.provider.restore_calls(), 0);
        let stored = stored_record(&h.store);
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.product_id, Some(Product::FamilyYearly));
        assert_eq!(h.ledger.snapshot().stories_used, 0);
    }

    #[tokio::test]
    async fn expired_record_carrying_credits_resets_to_trial() {
        let store = InMemoryStore::with_entry(
            KEY,
            r#"{"status":"expired","productId":null,"expiresAt":"2026-01-01T00:00:00Z","storiesUsed":0,"storiesRemaining":100,"storiesLimit":100}"#,
        );
        let h = harness_with(store, ScriptedPurchaseProvider::new(), Platform::Ios).await;
        assert_eq!(h.ledger.snapshot(), Subscription::default());
        assert_eq!(stored_record(&h.store), Subscription::default());

        for _ in 0..3 {
            h.ledger.consume_story().await.unwrap();
        }
        assert_eq!(
            h.ledger.consume_story().await.unwrap(),
            ConsumeOutcome::NotEntitled
        );
    }

    /// Store whose writes park until released while `hold` is set.
    #[derive(Default)]
    struct GatedStore {
        inner: InMemoryStore,
        hold: AtomicBool,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for GatedStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if self.hold.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            self.inner.set(key, value).await
        }
    }

    #[tokio::test]
    async fn overlapping_consumptions_are_both_recorded() {
        let store = Arc::new(GatedStore::default());
        let ledger = EntitlementLedger::open(
            test_config(Platform::Ios),
            store.clone(),
            Arc::new(ScriptedPurchaseProvider::new()),
            Arc::new(FixedClock::new(test_time())),
        )
        .await;
        store.hold.store(true, Ordering::SeqCst);

        let (first, second, ()) = tokio::join!(
            ledger.consume_story(),
            ledger.consume_story(),
            async {
                store.hold.store(false, Ordering::SeqCst);
                store.release.notify_one();
            },
        );

        assert!(first.unwrap().succeeded());
        assert!(second.unwrap().succeeded());

        let sub = ledger.snapshot();
        assert_eq!(sub.stories_used, 2);
        assert_eq!(sub.stories_remaining, 1);
        let stored = stored_record(&store.inner);
        assert_eq!(stored.stories_used, 2);
        assert_eq!(stored.stories_remaining, 1);
    }

    #[tokio::test]
    async fn reopened_ledger_sees_persisted_consumption() {
        let h = harness().await;
        h.ledger.consume_story().await.unwrap();

        let reopened = EntitlementLedger::open(
            test_config(Platform::Ios),
            h.store.clone(),
            h.provider.clone(),
            h.clock.clone(),
        )
        .await;
        assert_eq!(reopened.snapshot().stories_remaining, 2);
        assert_eq!(reopened.snapshot().stories_used, 1);
    }
}
