//! Subscription product catalog.

use core::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use fsv_core::DomainError;

/// A purchasable plan.
///
/// Serialized as its store product identifier (e.g. `fsv.family.yearly`), which is
/// also the form persisted in the subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Product {
    #[serde(rename = "fsv.family.yearly")]
    FamilyYearly,
    #[serde(rename = "fsv.family.monthly")]
    FamilyMonthly,
}

impl Product {
    /// Catalog in display order (the first entry is preselected on the paywall).
    pub const ALL: [Product; 2] = [Product::FamilyYearly, Product::FamilyMonthly];

    pub fn id(self) -> &'static str {
        match self {
            Product::FamilyYearly => "fsv.family.yearly",
            Product::FamilyMonthly => "fsv.family.monthly",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Product::FamilyYearly => "Yearly",
            Product::FamilyMonthly => "Monthly",
        }
    }

    pub fn display_price(self) -> &'static str {
        match self {
            Product::FamilyYearly => "$39.99",
            Product::FamilyMonthly => "$4.99",
        }
    }

    pub fn period_label(self) -> &'static str {
        match self {
            Product::FamilyYearly => "per year",
            Product::FamilyMonthly => "per month",
        }
    }

    pub fn savings_label(self) -> Option<&'static str> {
        match self {
            Product::FamilyYearly => Some("Save 33%"),
            Product::FamilyMonthly => None,
        }
    }

    pub fn is_popular(self) -> bool {
        matches!(self, Product::FamilyYearly)
    }

    pub fn features(self) -> &'static [&'static str] {
        match self {
            Product::FamilyYearly => &[
                "Unlimited stories",
                "All voice features",
                "Priority support",
                "New features first",
            ],
            Product::FamilyMonthly => &[
                "Unlimited stories",
                "All voice features",
                "Priority support",
            ],
        }
    }

    /// How long a successful purchase keeps the family `active`.
    pub fn entitlement_period(self) -> Duration {
        match self {
            Product::FamilyYearly => Duration::days(365),
            Product::FamilyMonthly => Duration::days(30),
        }
    }

    /// Price identifier understood by the web checkout backend.
    pub fn checkout_price_id(self) -> &'static str {
        match self {
            Product::FamilyYearly => "price_yearly_placeholder",
            Product::FamilyMonthly => "price_monthly_placeholder",
        }
    }
}

impl core::fmt::Display for Product {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Product {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::validation("product id must not be empty"));
        }
        Product::ALL
            .into_iter()
            .find(|p| p.id() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown product id: {s}")))
    }
}

/// Request body for the backend checkout-session endpoint.
///
/// Used where in-app purchases are unavailable and the purchase has to be
/// completed in an external web checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub mode: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutRequest {
    /// Success returns the user to the app root; cancel returns to the paywall.
    pub fn for_product(product: Product, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            mode: "subscription".to_string(),
            price_id: product.checkout_price_id().to_string(),
            success_url: format!("{base}/"),
            cancel_url: format!("{base}/paywall"),
        }
    }
}
