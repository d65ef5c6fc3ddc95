//! Daily/monthly spend ledger shared by all paid providers.
//!
//! Period boundaries are evaluated lazily: every check compares the stored period key
//! (`2025-07-14`, `2025-07`) with the current UTC wall clock and zeroes the counter
//! that rolled over. There is no background timer.

use chrono::{DateTime, Utc};
use common::BudgetConfig;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Slack for float accumulation when comparing against a cap.
const EPSILON: f64 = 1e-9;

pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetState {
    pub daily_spend: f64,
    pub monthly_spend: f64,
    pub daily_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
    pub day: String,
    pub month: String,
    /// Estimated cost of calls currently in flight
    pub reserved: f64,
}

impl BudgetState {
    fn new(config: &BudgetConfig, now: DateTime<Utc>) -> Self {
        Self {
            daily_spend: 0.0,
            monthly_spend: 0.0,
            daily_limit: config.daily_limit,
            monthly_limit: config.monthly_limit,
            day: day_key(now),
            month: month_key(now),
            reserved: 0.0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let day = day_key(now);
        if day != self.day {
            debug!(from = %self.day, to = %day, "budget day rolled over");
            self.daily_spend = 0.0;
            self.day = day;
        }
        let month = month_key(now);
        if month != self.month {
            debug!(from = %self.month, to = %month, "budget month rolled over");
            self.monthly_spend = 0.0;
            self.month = month;
        }
    }

    fn fits(&self, cost: f64) -> bool {
        let within = |spend: f64, limit: Option<f64>| {
            limit.map_or(true, |limit| spend + self.reserved + cost <= limit + EPSILON)
        };
        within(self.daily_spend, self.daily_limit) && within(self.monthly_spend, self.monthly_limit)
    }
}

/// Read-only view of the ledger at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub day: String,
    pub month: String,
    pub daily_spend: f64,
    pub daily_limit: Option<f64>,
    pub monthly_spend: f64,
    pub monthly_limit: Option<f64>,
    pub reserved: f64,
}

/// Estimated cost held against the caps while a call is in flight.
///
/// Dropping an unsettled reservation releases it with no cost recorded, which covers
/// calls cancelled mid-flight.
#[must_use = "a dropped reservation records no cost"]
#[derive(Debug)]
pub struct Reservation<'a> {
    ledger: &'a BudgetLedger,
    amount: f64,
    settled: bool,
}

impl Reservation<'_> {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Release the hold and record what the call actually cost.
    pub fn settle(self, actual_cost: f64) {
        self.settle_at(actual_cost, Utc::now())
    }

    pub fn settle_at(mut self, actual_cost: f64, now: DateTime<Utc>) {
        self.ledger.release(self.amount, actual_cost, now);
        self.settled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.release(self.amount, 0.0, Utc::now());
        }
    }
}

#[derive(Debug)]
pub struct BudgetLedger {
    state: Mutex<BudgetState>,
}

impl BudgetLedger {
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            state: Mutex::new(BudgetState::new(config, Utc::now())),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(&BudgetConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap the caps, keeping accumulated spend.
    pub fn set_limits(&self, config: &BudgetConfig) {
        let mut state = self.lock();
        state.daily_limit = config.daily_limit;
        state.monthly_limit = config.monthly_limit;
    }

    pub fn can_afford(&self, estimated_cost: f64) -> bool {
        self.can_afford_at(estimated_cost, Utc::now())
    }

    pub fn can_afford_at(&self, estimated_cost: f64, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        state.roll(now);
        state.fits(sanitize(estimated_cost))
    }

    /// Add an actual cost to both counters.
    pub fn record(&self, actual_cost: f64) {
        self.record_at(actual_cost, Utc::now())
    }

    pub fn record_at(&self, actual_cost: f64, now: DateTime<Utc>) {
        let cost = sanitize(actual_cost);
        let mut state = self.lock();
        state.roll(now);
        state.daily_spend += cost;
        state.monthly_spend += cost;
    }

    /// Check and hold `estimated_cost` in one step, so concurrent callers cannot
    /// jointly overrun a cap. `None` means the call must not be issued.
    pub fn reserve(&self, estimated_cost: f64) -> Option<Reservation<'_>> {
        self.reserve_at(estimated_cost, Utc::now())
    }

    pub fn reserve_at(&self, estimated_cost: f64, now: DateTime<Utc>) -> Option<Reservation<'_>> {
        let amount = sanitize(estimated_cost);
        let mut state = self.lock();
        state.roll(now);
        if !state.fits(amount) {
            return None;
        }
        state.reserved += amount;
        Some(Reservation {
            ledger: self,
            amount,
            settled: false,
        })
    }

    fn release(&self, amount: f64, actual_cost: f64, now: DateTime<Utc>) {
        let cost = sanitize(actual_cost);
        let mut state = self.lock();
        state.roll(now);
        state.reserved = (state.reserved - amount).max(0.0);
        state.daily_spend += cost;
        state.monthly_spend += cost;
    }

    /// Seed counters from persisted usage (e.g. at start-up).
    pub fn restore_at(&self, daily_spend: f64, monthly_spend: f64, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.roll(now);
        state.daily_spend = sanitize(daily_spend);
        state.monthly_spend = sanitize(monthly_spend).max(state.daily_spend);
        info!(
            daily = state.daily_spend,
            monthly = state.monthly_spend,
            "budget ledger restored"
        );
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Counters as they would read at `now`, without rolling the stored state.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> BudgetSnapshot {
        let state = self.lock();
        let day = day_key(now);
        let month = month_key(now);
        BudgetSnapshot {
            daily_spend: if state.day == day { state.daily_spend } else { 0.0 },
            monthly_spend: if state.month == month { state.monthly_spend } else { 0.0 },
            daily_limit: state.daily_limit,
            monthly_limit: state.monthly_limit,
            reserved: state.reserved,
            day,
            month,
        }
    }
}

/// Costs are never negative and never NaN.
fn sanitize(cost: f64) -> f64 {
    if cost.is_finite() && cost > 0.0 {
        cost
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ledger(daily: Option<f64>, monthly: Option<f64>) -> BudgetLedger {
        BudgetLedger::new(&BudgetConfig {
            daily_limit: daily,
            monthly_limit: monthly,
        })
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn boundary_is_affordable() {
        let now = at(2025, 7, 14, 12);
        let ledger = ledger(Some(1.0), Some(10.0));
        ledger.record_at(0.75, now);

        assert!(ledger.can_afford_at(0.25, now));
        assert!(!ledger.can_afford_at(0.26, now));
    }

    #[test]
    fn monthly_cap_applies_too() {
        let now = at(2025, 7, 14, 12);
        let ledger = ledger(Some(5.0), Some(1.0));
        ledger.record_at(0.9, now);
        assert!(!ledger.can_afford_at(0.2, now));
        assert!(ledger.can_afford_at(0.1, now));
    }

    #[test]
    fn unlimited_always_affords() {
        let ledger = BudgetLedger::unlimited();
        ledger.record(1_000.0);
        assert!(ledger.can_afford(1_000_000.0));
    }

    #[test]
    fn day_rollover_resets_daily_only() {
        let ledger = ledger(Some(1.0), Some(10.0));
        ledger.record_at(1.0, at(2025, 7, 14, 23));
        assert!(!ledger.can_afford_at(0.5, at(2025, 7, 14, 23)));

        assert!(ledger.can_afford_at(0.5, at(2025, 7, 15, 0)));
        let snap = ledger.snapshot_at(at(2025, 7, 15, 0));
        assert_eq!(snap.daily_spend, 0.0);
        assert_eq!(snap.monthly_spend, 1.0);
    }

    #[test]
    fn new_month_starts_from_the_new_request_alone() {
        let ledger = ledger(None, Some(100.0));
        ledger.record_at(42.0, at(2025, 6, 30, 22));
        ledger.record_at(3.0, at(2025, 6, 30, 23));

        ledger.record_at(1.5, at(2025, 7, 1, 0));
        let snap = ledger.snapshot_at(at(2025, 7, 1, 0));
        assert_eq!(snap.month, "2025-07");
        assert_eq!(snap.monthly_spend, 1.5);
        assert_eq!(snap.daily_spend, 1.5);
    }

    #[test]
    fn negative_and_nan_costs_are_ignored() {
        let now = at(2025, 7, 14, 12);
        let ledger = ledger(Some(1.0), None);
        ledger.record_at(-5.0, now);
        ledger.record_at(f64::NAN, now);
        let snap = ledger.snapshot_at(now);
        assert_eq!(snap.daily_spend, 0.0);
        assert_eq!(snap.monthly_spend, 0.0);
    }

    #[test]
    fn reservations_hold_budget_until_settled() {
        let now = at(2025, 7, 14, 12);
        let ledger = ledger(Some(1.0), None);

        let first = ledger.reserve_at(0.6, now).expect("fits");
        assert!(ledger.reserve_at(0.6, now).is_none());
        assert!(!ledger.can_afford_at(0.5, now));

        first.settle_at(0.1, now);
        let snap = ledger.snapshot_at(now);
        assert_eq!(snap.reserved, 0.0);
        assert!((snap.daily_spend - 0.1).abs() < 1e-12);
        assert!(ledger.reserve_at(0.6, now).is_some());
    }

    #[test]
    fn dropped_reservation_is_released() {
        let ledger = ledger(Some(1.0), None);
        {
            let _held = ledger.reserve(0.9).expect("fits");
            assert!(!ledger.can_afford(0.2));
        }
        assert!(ledger.can_afford(0.2));
        assert_eq!(ledger.snapshot().daily_spend, 0.0);
    }

    #[test]
    fn snapshot_does_not_mutate() {
        let ledger = ledger(Some(1.0), Some(2.0));
        ledger.record_at(0.5, at(2025, 7, 14, 12));

        let later = at(2025, 8, 2, 9);
        assert_eq!(ledger.snapshot_at(later), ledger.snapshot_at(later));
        assert_eq!(ledger.snapshot_at(later).monthly_spend, 0.0);
        // stored state still belongs to July
        assert_eq!(ledger.snapshot_at(at(2025, 7, 14, 13)).monthly_spend, 0.5);
    }

    #[test]
    fn restore_seeds_counters() {
        let now = at(2025, 7, 14, 12);
        let ledger = ledger(Some(1.0), Some(5.0));
        ledger.restore_at(0.4, 3.0, now);
        let snap = ledger.snapshot_at(now);
        assert_eq!(snap.daily_spend, 0.4);
        assert_eq!(snap.monthly_spend, 3.0);
        assert!(!ledger.can_afford_at(0.7, now));
    }
}
