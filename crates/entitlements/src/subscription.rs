//! The persisted subscription record and its status state machine.
//!
//! Every transition here is a pure function returning the next record; the
//! ledger decides when to apply and persist it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fsv_core::{DomainError, DomainResult};

use crate::catalog::Product;

/// Free stories granted to a new family.
pub const DEFAULT_TRIAL_STORY_LIMIT: u32 = 3;

/// Allotment written on activation. `active` bypasses the credit check, so this
/// only keeps the counters meaningful for display.
pub const ACTIVE_STORY_ALLOTMENT: u32 = 100;

/// Entitlement tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Reserved; no current flow produces it.
    #[serde(rename = "none")]
    Inactive,
    Trial,
    Active,
    Expired,
}

impl core::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            SubscriptionStatus::Inactive => "none",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Subscription/trial state for one family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub status: SubscriptionStatus,
    pub product_id: Option<Product>,
    pub expires_at: Option<DateTime<Utc>>,
    pub stories_used: u32,
    pub stories_remaining: u32,
    pub stories_limit: u32,
}

impl Default for Subscription {
    fn default() -> Self {
        Self::trial(DEFAULT_TRIAL_STORY_LIMIT)
    }
}

impl Subscription {
    /// Fresh trial with `limit` stories. A zero limit is raised to one.
    pub fn trial(limit: u32) -> Self {
        let limit = limit.max(1);
        Self {
            status: SubscriptionStatus::Trial,
            product_id: None,
            expires_at: None,
            stories_used: 0,
            stories_remaining: limit,
            stories_limit: limit,
        }
    }

    /// Check the record invariants. Used to reject persisted records that were
    /// written by something other than the ledger.
    pub fn validate(&self) -> DomainResult<()> {
        if self.stories_limit == 0 {
            return Err(DomainError::invariant("stories_limit must be positive"));
        }

        if self.product_id.is_some() != (self.status == SubscriptionStatus::Active) {
            return Err(DomainError::invariant(
                "product_id must be set exactly when status is active",
            ));
        }

        match self.status {
            SubscriptionStatus::Trial => {
                if self.expires_at.is_some() {
                    return Err(DomainError::invariant("trial must not carry expires_at"));
                }
                if self.stories_used.checked_add(self.stories_remaining)
                    != Some(self.stories_limit)
                {
                    return Err(DomainError::invariant(
                        "stories_used + stories_remaining must equal stories_limit during trial",
                    ));
                }
            }
            SubscriptionStatus::Active => {
                if self.expires_at.is_none() {
                    return Err(DomainError::invariant("active subscription needs expires_at"));
                }
            }
            SubscriptionStatus::Inactive => {
                if self.expires_at.is_some() {
                    return Err(DomainError::invariant("inactive record must not carry expires_at"));
                }
                if self.stories_remaining != 0 {
                    return Err(DomainError::invariant("inactive record must not carry credits"));
                }
            }
            SubscriptionStatus::Expired => {
                if self.stories_remaining != 0 {
                    return Err(DomainError::invariant("expired record must not carry credits"));
                }
            }
        }

        Ok(())
    }

    pub fn is_lapsed_at(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.expires_at) {
            (SubscriptionStatus::Active, Some(expires_at)) => now >= expires_at,
            _ => false,
        }
    }

    /// The record as it reads at `now`: an `active` record past `expiresAt` is `expired`.
    pub fn effective_at(&self, now: DateTime<Utc>) -> Subscription {
        if self.is_lapsed_at(now) {
            self.expired()
        } else {
            self.clone()
        }
    }

    pub fn can_create_story(&self) -> bool {
        match self.status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::Trial
            | SubscriptionStatus::Inactive
            | SubscriptionStatus::Expired => self.stories_remaining > 0,
        }
    }

    pub fn needs_paywall(&self) -> bool {
        self.status == SubscriptionStatus::Trial && self.stories_remaining == 0
    }

    /// Stories left for display; `None` means unlimited.
    pub fn remaining_credits(&self) -> Option<u32> {
        match self.status {
            SubscriptionStatus::Active => None,
            SubscriptionStatus::Trial
            | SubscriptionStatus::Inactive
            | SubscriptionStatus::Expired => Some(self.stories_remaining),
        }
    }

    /// Record after spending one story, or `None` when there is no credit to spend.
    pub fn consumed(&self) -> Option<Subscription> {
        if !self.can_create_story() {
            return None;
        }
        Some(Subscription {
            stories_used: self.stories_used.saturating_add(1),
            stories_remaining: self.stories_remaining.saturating_sub(1),
            ..self.clone()
        })
    }

    /// Record after a successful purchase at `now`.
    pub fn activated(product: Product, now: DateTime<Utc>) -> Subscription {
        Self::activated_until(product, now + product.entitlement_period())
    }

    pub fn activated_until(product: Product, expires_at: DateTime<Utc>) -> Subscription {
        Subscription {
            status: SubscriptionStatus::Active,
            product_id: Some(product),
            expires_at: Some(expires_at),
            stories_used: 0,
            stories_remaining: ACTIVE_STORY_ALLOTMENT,
            stories_limit: ACTIVE_STORY_ALLOTMENT,
        }
    }

    /// Lapsed form of this record. No product, no credits; `expiresAt` is kept as
    /// the time the entitlement ended.
    pub fn expired(&self) -> Subscription {
        Subscription {
            status: SubscriptionStatus::Expired,
            product_id: None,
            stories_remaining: 0,
            ..self.clone()
        }
    }
}
