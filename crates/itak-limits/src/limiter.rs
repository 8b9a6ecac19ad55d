//! The limiter itself.
//!
//! `reserve` is the only critical section: it checks every applicable
//! bucket and, only if all admit the request, increments them together.
//! `commit` and `rollback` are purely additive atomic updates.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use itak_core::{Classify, ErrorKind, PrincipalId};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LimiterConfig;
use crate::counters::{to_micro, to_usd, UsageSnapshot, WindowCounter, WindowKind, WindowUsage};

/// Which rate bucket a request is counted in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    Global,
    Principal(PrincipalId),
    Tool(String),
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Principal(id) => write!(f, "principal:{id}"),
            Self::Tool(name) => write!(f, "tool:{name}"),
        }
    }
}

/// Fixed one-minute request window.
#[derive(Debug, Default)]
struct RateBucket {
    /// Minute epoch the count belongs to.
    minute: AtomicU64,
    count: AtomicU32,
}

impl RateBucket {
    fn roll(&self, minute: u64) {
        let stored = self.minute.load(Ordering::Acquire);
        if stored != minute
            && self
                .minute
                .compare_exchange(stored, minute, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.count.store(0, Ordering::Release);
        }
    }
}

/// Reservation denial reasons.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Denied {
    /// A request-rate bucket is full.
    #[error("rate limited by {bucket} bucket, retry in {retry_after_secs}s")]
    RateBucket {
        /// Bucket description.
        bucket: String,
        /// Seconds until the window rolls.
        retry_after_secs: u64,
    },

    /// The principal is locked out after repeated auth failures.
    #[error("locked out until {until}")]
    Locked {
        /// When the lockout lifts.
        until: DateTime<Utc>,
    },

    /// A hard cost budget would be exceeded.
    #[error("{window} budget exhausted: spent ${spent:.2} of ${limit:.2}")]
    HardBudget {
        /// The window that denied.
        window: WindowKind,
        /// Spend (committed + reserved) in that window.
        spent: f64,
        /// The hard limit.
        limit: f64,
    },
}

impl Classify for Denied {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::RateBucket { .. } | Self::Locked { .. } => ErrorKind::RateLimited,
            Self::HardBudget { .. } => ErrorKind::BudgetExceeded,
        }
    }
}

/// Soft-threshold crossing, reported on an otherwise successful reserve.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetWarning {
    /// The window that crossed its soft threshold.
    pub window: WindowKind,
    /// Projected spend including this reservation.
    pub projected_usd: f64,
    /// The window's full budget.
    pub budget_usd: f64,
}

/// What a caller asks to reserve.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Requesting principal.
    pub principal: PrincipalId,
    /// The principal's own rpm override, from its rate policy.
    pub principal_rpm: Option<u32>,
    /// Tool (or role-as-tool) bucket to count against.
    pub tool: Option<String>,
    /// Estimated dollar cost.
    pub estimated_usd: f64,
    /// Free (local) models bypass cost windows but not request buckets.
    pub free_model: bool,
}

impl ReserveRequest {
    /// A request with no tool bucket and the given estimate.
    #[must_use]
    pub fn new(principal: PrincipalId, estimated_usd: f64) -> Self {
        Self {
            principal,
            principal_rpm: None,
            tool: None,
            estimated_usd,
            free_model: false,
        }
    }

    /// Count against a tool bucket.
    #[must_use]
    pub fn for_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Mark as a free-model request.
    #[must_use]
    pub fn free(mut self) -> Self {
        self.free_model = true;
        self
    }

    /// Apply the principal's rpm override.
    #[must_use]
    pub fn with_principal_rpm(mut self, rpm: u32) -> Self {
        self.principal_rpm = Some(rpm);
        self
    }
}

/// A granted reservation. Must be either committed or rolled back.
#[derive(Debug)]
pub struct Reservation {
    /// Reservation id, for log correlation.
    pub id: Uuid,
    /// Reserved micro-dollars (0 for free models).
    micro: u64,
    /// Rate buckets incremented, with the minute they were counted in.
    buckets: Vec<(BucketKey, u64)>,
    /// Soft warnings crossed by this reservation.
    pub warnings: Vec<BudgetWarning>,
}

impl Reservation {
    /// The reserved estimate in USD.
    #[must_use]
    pub fn estimated_usd(&self) -> f64 {
        to_usd(self.micro)
    }
}

/// Sliding auth-failure counter.
#[derive(Debug)]
struct FailureWindow {
    window_start: DateTime<Utc>,
    count: u32,
}

/// The rate/cost limiter shared by the router, the executor, and the gateway.
#[derive(Debug)]
pub struct RateLimiter {
    config: std::sync::RwLock<LimiterConfig>,
    rate_buckets: DashMap<BucketKey, RateBucket>,
    daily: WindowCounter,
    weekly: WindowCounter,
    monthly: WindowCounter,
    auth_failures: DashMap<String, FailureWindow>,
    lockouts: DashMap<String, DateTime<Utc>>,
    override_until: Mutex<Option<DateTime<Utc>>>,
    /// Serializes multi-bucket check-then-increment.
    reserve_gate: Mutex<()>,
}

impl RateLimiter {
    /// Create a limiter with the given configuration.
    #[must_use]
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config: std::sync::RwLock::new(config),
            rate_buckets: DashMap::new(),
            daily: WindowCounter::default(),
            weekly: WindowCounter::default(),
            monthly: WindowCounter::default(),
            auth_failures: DashMap::new(),
            lockouts: DashMap::new(),
            override_until: Mutex::new(None),
            reserve_gate: Mutex::new(()),
        }
    }

    /// Replace the configuration (admin reload).
    ///
    /// # Panics
    ///
    /// Panics if the config lock is poisoned.
    pub fn reload(&self, config: LimiterConfig) {
        *self.config.write().expect("limiter config lock poisoned") = config;
    }

    fn window(&self, kind: WindowKind) -> &WindowCounter {
        match kind {
            WindowKind::Daily => &self.daily,
            WindowKind::Weekly => &self.weekly,
            WindowKind::Monthly => &self.monthly,
        }
    }

    fn budget_for(config: &LimiterConfig, kind: WindowKind) -> Option<f64> {
        match kind {
            WindowKind::Daily => config.budgets.daily_usd,
            WindowKind::Weekly => config.budgets.weekly_usd,
            WindowKind::Monthly => config.budgets.monthly_usd,
        }
    }

    /// Attempt a reservation. All applicable buckets must admit the
    /// request; nothing is counted on denial.
    ///
    /// # Errors
    ///
    /// Returns [`Denied`] describing the first bucket that refused.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    pub fn reserve(&self, req: &ReserveRequest) -> Result<Reservation, Denied> {
        let now = Utc::now();

        if let Some(until) = self.lockout_until(&req.principal.to_string(), now) {
            return Err(Denied::Locked { until });
        }

        let config = self.config.read().expect("limiter config lock poisoned");
        #[allow(clippy::cast_sign_loss)]
        let minute = (now.timestamp() / 60).max(0) as u64;

        // Applicable rate buckets and their caps.
        let mut applicable: Vec<(BucketKey, u32)> = Vec::new();
        if let Some(cap) = config.global_rpm {
            applicable.push((BucketKey::Global, cap));
        }
        if let Some(cap) = req.principal_rpm.or(config.per_principal_rpm) {
            applicable.push((BucketKey::Principal(req.principal), cap));
        }
        if let Some(tool) = &req.tool
            && let Some(cap) = config.per_tool_rpm.get(tool)
        {
            applicable.push((BucketKey::Tool(tool.clone()), *cap));
        }

        let micro = if req.free_model {
            0
        } else {
            to_micro(req.estimated_usd)
        };

        let _gate = self.reserve_gate.lock().expect("reserve gate poisoned");

        // Check every rate bucket first; increment nothing until all pass.
        for (key, cap) in &applicable {
            let bucket = self.rate_buckets.entry(key.clone()).or_default();
            bucket.roll(minute);
            if bucket.count.load(Ordering::Acquire) >= *cap {
                #[allow(clippy::cast_sign_loss)]
                let retry_after_secs = (60 - (now.timestamp() % 60)).max(1) as u64;
                return Err(Denied::RateBucket {
                    bucket: key.to_string(),
                    retry_after_secs,
                });
            }
        }

        // Cost windows, tightest first. Free models bypass entirely.
        let mut warnings = Vec::new();
        if micro > 0 {
            let override_active = self
                .override_until
                .lock()
                .expect("override lock poisoned")
                .is_some_and(|until| until > now);

            for kind in WindowKind::ALL {
                let Some(budget) = Self::budget_for(&config, kind) else {
                    continue;
                };
                let counter = self.window(kind);
                counter.roll(kind, now);
                let projected = counter.projected_micro().saturating_add(micro);
                let hard = to_micro(budget * f64::from(config.budgets.hard_percent) / 100.0);
                let soft = to_micro(budget * f64::from(config.budgets.soft_percent) / 100.0);
                if projected > hard && !override_active {
                    return Err(Denied::HardBudget {
                        window: kind,
                        spent: to_usd(counter.projected_micro()),
                        limit: to_usd(hard),
                    });
                }
                if projected >= soft {
                    warnings.push(BudgetWarning {
                        window: kind,
                        projected_usd: to_usd(projected),
                        budget_usd: budget,
                    });
                }
            }
        }

        // All admitted: count everything.
        let mut counted = Vec::with_capacity(applicable.len());
        for (key, _) in applicable {
            let bucket = self.rate_buckets.entry(key.clone()).or_default();
            bucket.count.fetch_add(1, Ordering::AcqRel);
            counted.push((key, minute));
        }
        if micro > 0 {
            for kind in WindowKind::ALL {
                self.window(kind).reserve(micro);
            }
        }

        for warning in &warnings {
            warn!(
                window = %warning.window,
                projected_usd = warning.projected_usd,
                budget_usd = warning.budget_usd,
                "Soft budget threshold crossed"
            );
        }

        Ok(Reservation {
            id: Uuid::new_v4(),
            micro,
            buckets: counted,
            warnings,
        })
    }

    /// Commit a reservation with actuals. Rate bucket counts stand.
    pub fn commit(&self, reservation: Reservation, actual_usd: f64, tokens_in: u64, tokens_out: u64) {
        let actual = to_micro(actual_usd);
        for kind in WindowKind::ALL {
            self.window(kind)
                .commit(reservation.micro, actual, tokens_in, tokens_out);
        }
        debug!(reservation = %reservation.id, actual_usd, "Reservation committed");
    }

    /// Roll back a reservation, restoring every counter to its pre-reserve
    /// value.
    pub fn rollback(&self, reservation: Reservation) {
        for (key, minute) in &reservation.buckets {
            if let Some(bucket) = self.rate_buckets.get(key)
                && bucket.minute.load(Ordering::Acquire) == *minute
            {
                let mut current = bucket.count.load(Ordering::Acquire);
                loop {
                    let next = current.saturating_sub(1);
                    match bucket.count.compare_exchange(
                        current,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current = actual,
                    }
                }
            }
        }
        if reservation.micro > 0 {
            for kind in WindowKind::ALL {
                self.window(kind).release(reservation.micro);
            }
        }
        debug!(reservation = %reservation.id, "Reservation rolled back");
    }

    /// Record an authentication failure for `key` (a principal id or a
    /// gateway peer identity). Returns the lockout deadline if this
    /// failure triggered one.
    ///
    /// # Panics
    ///
    /// Panics if the config lock is poisoned.
    pub fn record_auth_failure(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let (threshold, window, duration) = {
            let config = self.config.read().expect("limiter config lock poisoned");
            (
                config.lockout.threshold,
                chrono::Duration::from_std(config.lockout.window).unwrap_or_default(),
                chrono::Duration::from_std(config.lockout.duration).unwrap_or_default(),
            )
        };

        let mut entry = self
            .auth_failures
            .entry(key.to_string())
            .or_insert_with(|| FailureWindow {
                window_start: now,
                count: 0,
            });
        if now.signed_duration_since(entry.window_start) > window {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);

        if entry.count >= threshold {
            let until = now.checked_add_signed(duration).unwrap_or(now);
            self.lockouts.insert(key.to_string(), until);
            entry.count = 0;
            warn!(key, %until, "Auth-failure lockout engaged");
            return Some(until);
        }
        None
    }

    /// Whether `key` is currently locked out, and until when.
    #[must_use]
    pub fn lockout_until(&self, key: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(until) = self.lockouts.get(key) {
            if *until > now {
                return Some(*until);
            }
        }
        self.lockouts.remove_if(key, |_, until| *until <= now);
        None
    }

    /// Grant a time-boxed hard-budget override (owner operation).
    ///
    /// # Panics
    ///
    /// Panics if the override lock is poisoned.
    pub fn grant_override(&self, until: DateTime<Utc>) {
        *self.override_until.lock().expect("override lock poisoned") = Some(until);
        warn!(%until, "Hard-budget override granted");
    }

    /// Clear any active override.
    ///
    /// # Panics
    ///
    /// Panics if the override lock is poisoned.
    pub fn clear_override(&self) {
        *self.override_until.lock().expect("override lock poisoned") = None;
    }

    /// Current usage for one window kind.
    #[must_use]
    pub fn usage(&self, kind: WindowKind) -> WindowUsage {
        let counter = self.window(kind);
        counter.roll(kind, Utc::now());
        counter.usage()
    }

    /// Snapshot all windows for persistence.
    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            taken_at: Utc::now(),
            windows: WindowKind::ALL
                .into_iter()
                .map(|kind| (kind, self.usage(kind)))
                .collect(),
            schema: UsageSnapshot::schema_version(),
        }
    }

    /// Restore window totals from a snapshot. Windows that rolled since
    /// the snapshot start fresh on first touch.
    pub fn restore(&self, snapshot: &UsageSnapshot) {
        for (kind, usage) in &snapshot.windows {
            self.window(*kind).restore(*kind, snapshot.taken_at, usage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CostBudgetConfig, LockoutConfig};
    use std::time::Duration;

    fn limiter(budget: CostBudgetConfig) -> RateLimiter {
        RateLimiter::new(LimiterConfig {
            global_rpm: Some(10),
            per_principal_rpm: Some(5),
            per_tool_rpm: [("code_exec".to_string(), 2)].into(),
            budgets: budget,
            lockout: LockoutConfig {
                threshold: 3,
                window: Duration::from_secs(60),
                duration: Duration::from_secs(60),
            },
        })
    }

    fn no_budget() -> CostBudgetConfig {
        CostBudgetConfig {
            daily_usd: None,
            weekly_usd: None,
            monthly_usd: None,
            ..CostBudgetConfig::default()
        }
    }

    #[test]
    fn reserve_rollback_restores_counters_exactly() {
        let limiter = limiter(CostBudgetConfig::default());
        let principal = PrincipalId::new();
        let before = limiter.usage(WindowKind::Daily);

        let req = ReserveRequest::new(principal, 0.05).for_tool("code_exec");
        let reservation = limiter.reserve(&req).unwrap();
        limiter.rollback(reservation);

        assert_eq!(limiter.usage(WindowKind::Daily), before);
        // The tool bucket is back at zero: two more reservations fit.
        assert!(limiter.reserve(&req).is_ok());
        assert!(limiter.reserve(&req).is_ok());
        assert!(matches!(
            limiter.reserve(&req),
            Err(Denied::RateBucket { .. })
        ));
    }

    #[test]
    fn all_or_nothing_across_buckets() {
        let limiter = limiter(no_budget());
        let principal = PrincipalId::new();
        let req = ReserveRequest::new(principal, 0.0).for_tool("code_exec");

        // Exhaust the tool bucket (cap 2).
        let _r1 = limiter.reserve(&req).unwrap();
        let _r2 = limiter.reserve(&req).unwrap();
        let denied = limiter.reserve(&req).unwrap_err();
        assert!(matches!(denied, Denied::RateBucket { ref bucket, .. } if bucket.contains("tool")));

        // The denied attempt consumed nothing from the principal bucket:
        // all 5 principal slots minus the 2 spent remain usable.
        let plain = ReserveRequest::new(principal, 0.0);
        for _ in 0..3 {
            limiter.reserve(&plain).unwrap();
        }
        assert!(matches!(
            limiter.reserve(&plain),
            Err(Denied::RateBucket { .. })
        ));
    }

    #[test]
    fn hard_budget_denies_without_counting() {
        let limiter = limiter(CostBudgetConfig {
            daily_usd: Some(1.0),
            weekly_usd: None,
            monthly_usd: None,
            soft_percent: 80,
            hard_percent: 100,
        });
        let principal = PrincipalId::new();

        // Spend $0.99.
        let r = limiter
            .reserve(&ReserveRequest::new(principal, 0.99))
            .unwrap();
        limiter.commit(r, 0.99, 1000, 100);

        // A $0.05 estimate must be denied, counter unchanged.
        let before = limiter.usage(WindowKind::Daily);
        let denied = limiter
            .reserve(&ReserveRequest::new(principal, 0.05))
            .unwrap_err();
        assert!(matches!(denied, Denied::HardBudget { window: WindowKind::Daily, .. }));
        assert_eq!(limiter.usage(WindowKind::Daily), before);
    }

    #[test]
    fn free_models_bypass_cost_but_not_rate() {
        let limiter = limiter(CostBudgetConfig {
            daily_usd: Some(0.01),
            weekly_usd: None,
            monthly_usd: None,
            soft_percent: 80,
            hard_percent: 100,
        });
        let principal = PrincipalId::new();

        // Way over budget, but free.
        let r = limiter
            .reserve(&ReserveRequest::new(principal, 9.99).free())
            .unwrap();
        limiter.commit(r, 0.0, 500, 50);

        // Rate buckets still apply (principal cap 5, one used).
        for _ in 0..4 {
            limiter
                .reserve(&ReserveRequest::new(principal, 0.0).free())
                .unwrap();
        }
        assert!(matches!(
            limiter.reserve(&ReserveRequest::new(principal, 0.0).free()),
            Err(Denied::RateBucket { .. })
        ));
    }

    #[test]
    fn soft_threshold_warns_without_blocking() {
        let limiter = limiter(CostBudgetConfig {
            daily_usd: Some(1.0),
            weekly_usd: None,
            monthly_usd: None,
            soft_percent: 50,
            hard_percent: 100,
        });
        let reservation = limiter
            .reserve(&ReserveRequest::new(PrincipalId::new(), 0.60))
            .unwrap();
        assert_eq!(reservation.warnings.len(), 1);
        assert_eq!(reservation.warnings[0].window, WindowKind::Daily);
    }

    #[test]
    fn lockout_engages_on_threshold() {
        let limiter = limiter(no_budget());
        let principal = PrincipalId::new();
        let key = principal.to_string();

        assert!(limiter.record_auth_failure(&key).is_none());
        assert!(limiter.record_auth_failure(&key).is_none());
        // Third failure hits the threshold.
        let until = limiter.record_auth_failure(&key).unwrap();
        assert!(until > Utc::now());

        let denied = limiter
            .reserve(&ReserveRequest::new(principal, 0.0))
            .unwrap_err();
        assert!(matches!(denied, Denied::Locked { .. }));
    }

    #[test]
    fn override_lifts_hard_budget() {
        let limiter = limiter(CostBudgetConfig {
            daily_usd: Some(0.10),
            weekly_usd: None,
            monthly_usd: None,
            soft_percent: 80,
            hard_percent: 100,
        });
        let principal = PrincipalId::new();
        let r = limiter
            .reserve(&ReserveRequest::new(principal, 0.10))
            .unwrap();
        limiter.commit(r, 0.10, 100, 10);

        assert!(limiter
            .reserve(&ReserveRequest::new(principal, 0.05))
            .is_err());

        limiter.grant_override(Utc::now() + chrono::Duration::minutes(5));
        assert!(limiter
            .reserve(&ReserveRequest::new(principal, 0.05))
            .is_ok());
    }

    #[test]
    fn snapshot_round_trip() {
        let limiter = limiter(CostBudgetConfig::default());
        let r = limiter
            .reserve(&ReserveRequest::new(PrincipalId::new(), 0.25))
            .unwrap();
        limiter.commit(r, 0.20, 2000, 150);

        let snapshot = limiter.snapshot();
        let restored = RateLimiter::new(LimiterConfig::default());
        restored.restore(&snapshot);
        assert!((restored.usage(WindowKind::Daily).spent_usd - 0.20).abs() < 1e-9);
        assert_eq!(restored.usage(WindowKind::Daily).tokens_in, 2000);
    }
}
