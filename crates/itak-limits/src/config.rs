//! Limiter configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Cost budget thresholds for one rolling window set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBudgetConfig {
    /// Daily budget in USD. `None` disables the window.
    pub daily_usd: Option<f64>,
    /// Weekly budget in USD.
    pub weekly_usd: Option<f64>,
    /// Monthly budget in USD.
    pub monthly_usd: Option<f64>,
    /// Soft threshold as a percentage of each window budget. Crossing it
    /// emits a warning but does not block.
    pub soft_percent: u8,
    /// Hard threshold as a percentage of each window budget. Crossing it
    /// denies model-incurring reservations until the window rolls or the
    /// owner issues a time-boxed override.
    pub hard_percent: u8,
}

impl Default for CostBudgetConfig {
    fn default() -> Self {
        Self {
            daily_usd: Some(5.0),
            weekly_usd: Some(25.0),
            monthly_usd: Some(80.0),
            soft_percent: 80,
            hard_percent: 100,
        }
    }
}

/// Auth-failure lockout policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutConfig {
    /// Failures within `window` that trigger lockout.
    pub threshold: u32,
    /// Window over which failures are counted.
    #[serde(with = "humantime_secs")]
    pub window: Duration,
    /// How long a lockout lasts.
    #[serde(with = "humantime_secs")]
    pub duration: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(300),
            duration: Duration::from_secs(900),
        }
    }
}

/// Top-level limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LimiterConfig {
    /// Global requests-per-minute cap. `None` disables the bucket.
    pub global_rpm: Option<u32>,
    /// Default per-principal requests-per-minute cap, overridden by each
    /// principal's own rate policy.
    pub per_principal_rpm: Option<u32>,
    /// Per-tool requests-per-minute caps, keyed by tool name.
    #[serde(default)]
    pub per_tool_rpm: HashMap<String, u32>,
    /// Cost budget thresholds.
    #[serde(default)]
    pub budgets: CostBudgetConfig,
    /// Lockout policy.
    #[serde(default)]
    pub lockout: LockoutConfig,
}

/// Serialize durations as integer seconds; the config file is JSON.
mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
