//! Atomic window counters.
//!
//! Costs are tracked in micro-dollars so they fit lock-free atomics;
//! `commit` and `rollback` are plain atomic adds/subs. Fixed windows are
//! identified by an epoch-derived id; a counter whose stored window id is
//! stale resets itself on first touch.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// One micro-dollar = 1e-6 USD.
const MICRO: f64 = 1_000_000.0;

/// Convert USD to micro-dollars, saturating at zero.
pub(crate) fn to_micro(usd: f64) -> u64 {
    if usd <= 0.0 {
        0
    } else {
        // Budgets are small human-scale numbers; precision loss is moot.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            (usd * MICRO) as u64
        }
    }
}

/// Convert micro-dollars back to USD.
pub(crate) fn to_usd(micro: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        micro as f64 / MICRO
    }
}

/// Rolling cost window kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Calendar day (UTC).
    Daily,
    /// ISO week (UTC).
    Weekly,
    /// Calendar month (UTC).
    Monthly,
}

impl WindowKind {
    /// All kinds, checked in tightest-first order.
    pub const ALL: [Self; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    /// Identifier of the window containing `at`. Changing id means the
    /// window rolled and the counter resets.
    #[must_use]
    pub fn window_id(self, at: DateTime<Utc>) -> u64 {
        #[allow(clippy::cast_sign_loss)]
        match self {
            Self::Daily => u64::from(at.num_days_from_ce() as u32),
            Self::Weekly => {
                let week = at.iso_week();
                (u64::from(week.year() as u32)).wrapping_mul(100).wrapping_add(u64::from(week.week()))
            },
            Self::Monthly => {
                (u64::from(at.year() as u32)).wrapping_mul(100).wrapping_add(u64::from(at.month()))
            },
        }
    }
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// Lock-free counter for one cost window.
#[derive(Debug, Default)]
pub(crate) struct WindowCounter {
    /// Window id the totals belong to.
    window_id: AtomicU64,
    /// Committed spend, micro-dollars.
    committed: AtomicU64,
    /// In-flight reserved spend, micro-dollars.
    reserved: AtomicU64,
    /// Committed prompt tokens.
    tokens_in: AtomicU64,
    /// Committed completion tokens.
    tokens_out: AtomicU64,
    /// Committed request count.
    requests: AtomicU64,
}

impl WindowCounter {
    /// Reset totals if the window rolled past the stored id.
    pub(crate) fn roll(&self, kind: WindowKind, now: DateTime<Utc>) {
        let id = kind.window_id(now);
        let stored = self.window_id.load(Ordering::Acquire);
        if stored != id
            && self
                .window_id
                .compare_exchange(stored, id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.committed.store(0, Ordering::Release);
            self.reserved.store(0, Ordering::Release);
            self.tokens_in.store(0, Ordering::Release);
            self.tokens_out.store(0, Ordering::Release);
            self.requests.store(0, Ordering::Release);
        }
    }

    /// Committed + reserved spend, micro-dollars.
    pub(crate) fn projected_micro(&self) -> u64 {
        self.committed
            .load(Ordering::Acquire)
            .saturating_add(self.reserved.load(Ordering::Acquire))
    }

    /// Committed spend, micro-dollars.
    pub(crate) fn committed_micro(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn reserve(&self, micro: u64) {
        self.reserved.fetch_add(micro, Ordering::AcqRel);
    }

    pub(crate) fn release(&self, micro: u64) {
        // Saturating: a rollback after a window roll must not underflow.
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(micro);
            match self.reserved.compare_exchange(
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

    pub(crate) fn commit(&self, reserved_micro: u64, actual_micro: u64, tokens_in: u64, tokens_out: u64) {
        self.release(reserved_micro);
        self.committed.fetch_add(actual_micro, Ordering::AcqRel);
        self.tokens_in.fetch_add(tokens_in, Ordering::AcqRel);
        self.tokens_out.fetch_add(tokens_out, Ordering::AcqRel);
        self.requests.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn usage(&self) -> WindowUsage {
        WindowUsage {
            spent_usd: to_usd(self.committed.load(Ordering::Acquire)),
            reserved_usd: to_usd(self.reserved.load(Ordering::Acquire)),
            tokens_in: self.tokens_in.load(Ordering::Acquire),
            tokens_out: self.tokens_out.load(Ordering::Acquire),
            requests: self.requests.load(Ordering::Acquire),
        }
    }

    pub(crate) fn restore(&self, kind: WindowKind, now: DateTime<Utc>, usage: &WindowUsage) {
        self.window_id.store(kind.window_id(now), Ordering::Release);
        self.committed.store(to_micro(usage.spent_usd), Ordering::Release);
        // In-flight reservations do not survive a restart.
        self.reserved.store(0, Ordering::Release);
        self.tokens_in.store(usage.tokens_in, Ordering::Release);
        self.tokens_out.store(usage.tokens_out, Ordering::Release);
        self.requests.store(usage.requests, Ordering::Release);
    }
}

/// Point-in-time usage of one window, as exposed by `GET /costs` and the
/// usage snapshot files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WindowUsage {
    /// Committed spend in USD.
    pub spent_usd: f64,
    /// In-flight reserved spend in USD.
    pub reserved_usd: f64,
    /// Committed prompt tokens.
    pub tokens_in: u64,
    /// Committed completion tokens.
    pub tokens_out: u64,
    /// Committed requests.
    pub requests: u64,
}

/// Serializable snapshot of all cost windows, persisted under `data/usage/`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageSnapshot {
    /// Snapshot time; windows whose id differs at restore time start fresh.
    pub taken_at: DateTime<Utc>,
    /// Usage per window kind.
    pub windows: Vec<(WindowKind, WindowUsage)>,
    /// Schema version of the snapshot file.
    #[serde(default = "UsageSnapshot::schema_version")]
    pub schema: u32,
}

impl UsageSnapshot {
    /// Current snapshot schema version.
    #[must_use]
    pub fn schema_version() -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_roll_resets_totals() {
        let counter = WindowCounter::default();
        let day1 = "2026-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let day2 = "2026-03-02T10:00:00Z".parse::<DateTime<Utc>>().unwrap();

        counter.roll(WindowKind::Daily, day1);
        counter.commit(0, to_micro(0.50), 100, 20);
        assert!((counter.usage().spent_usd - 0.50).abs() < 1e-9);

        counter.roll(WindowKind::Daily, day2);
        assert!(counter.usage().spent_usd.abs() < 1e-9);
    }

    #[test]
    fn reserve_release_is_exact() {
        let counter = WindowCounter::default();
        counter.reserve(to_micro(0.05));
        counter.release(to_micro(0.05));
        assert_eq!(counter.projected_micro(), 0);
    }

    #[test]
    fn release_saturates_after_roll() {
        let counter = WindowCounter::default();
        counter.release(to_micro(1.0));
        assert_eq!(counter.projected_micro(), 0);
    }
}
