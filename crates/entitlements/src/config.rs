//! Ledger configuration.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use fsv_core::{DomainError, FamilyId};

use crate::subscription::DEFAULT_TRIAL_STORY_LIMIT;

/// Fixed key the subscription record is stored under.
pub const DEFAULT_STORAGE_KEY: &str = "@family_story_voices:subscription";

/// Runtime platform the app is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    /// Browsers have no store; purchases go through external checkout instead.
    pub fn supports_in_app_purchases(self) -> bool {
        match self {
            Platform::Ios | Platform::Android => true,
            Platform::Web => false,
        }
    }
}

impl FromStr for Platform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "web" => Ok(Platform::Web),
            other => Err(DomainError::validation(format!("unknown platform: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub family_id: FamilyId,
    pub platform: Platform,
    pub trial_story_limit: u32,
    pub storage_key: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            family_id: FamilyId::new(),
            platform: Platform::Ios,
            trial_story_limit: DEFAULT_TRIAL_STORY_LIMIT,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl LedgerConfig {
    /// Read `FSV_PLATFORM`, `FSV_TRIAL_STORY_LIMIT`, `FSV_STORAGE_KEY` and `FSV_FAMILY_ID`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup. Invalid values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("FSV_PLATFORM") {
            match raw.parse::<Platform>() {
                Ok(platform) => config.platform = platform,
                Err(err) => tracing::warn!(%err, "FSV_PLATFORM invalid; using default"),
            }
        }

        if let Some(raw) = lookup("FSV_TRIAL_STORY_LIMIT") {
            match raw.trim().parse::<u32>() {
                Ok(limit) if limit > 0 => config.trial_story_limit = limit,
                _ => tracing::warn!(value = %raw, "FSV_TRIAL_STORY_LIMIT must be a positive integer; using default"),
            }
        }

        if let Some(raw) = lookup("FSV_STORAGE_KEY") {
            if raw.trim().is_empty() {
                tracing::warn!("FSV_STORAGE_KEY is empty; using default");
            } else {
                config.storage_key = raw;
            }
        }

        match lookup("FSV_FAMILY_ID").map(|raw| raw.parse::<FamilyId>()) {
            Some(Ok(id)) => config.family_id = id,
            Some(Err(err)) => tracing::warn!(%err, "FSV_FAMILY_ID invalid; generating a new id"),
            None => {}
        }

        config
    }
}
