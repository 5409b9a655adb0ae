//! Quota governor.
//!
//! Owned by the router actor, so none of this state is shared or locked.
//! Three limits apply to every provider call: a rolling one-second rate,
//! a cap on simultaneous calls, and a per-UTC-day request budget.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

/// Outcome of asking for a dispatch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Slot taken; call `release` when the call finishes
    Granted,
    /// Rate limited until this instant
    WaitUntil(Instant),
    /// All concurrency slots are busy
    AtCapacity,
    /// No budget left today
    BudgetExhausted,
}

#[derive(Debug)]
pub struct QuotaGovernor {
    per_second_limit: usize,
    concurrency: usize,
    daily_budget: u64,
    window: VecDeque<Instant>,
    in_flight: usize,
    day: Option<NaiveDate>,
    used_today: u64,
}

impl QuotaGovernor {
    pub fn new(per_second_limit: u32, concurrency: usize, daily_budget: u64) -> Self {
        Self {
            per_second_limit: per_second_limit.max(1) as usize,
            concurrency: concurrency.max(1),
            daily_budget,
            window: VecDeque::new(),
            in_flight: 0,
            day: None,
            used_today: 0,
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.used_today = 0;
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.window.front() {
            if front + WINDOW <= now {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Try to take a dispatch slot at `now`.
    pub fn try_acquire(&mut self, now: Instant, today: NaiveDate) -> Admission {
        self.roll_day(today);
        if self.used_today >= self.daily_budget {
            return Admission::BudgetExhausted;
        }
        if self.in_flight >= self.concurrency {
            return Admission::AtCapacity;
        }
        self.prune(now);
        if self.window.len() >= self.per_second_limit {
            if let Some(&oldest) = self.window.front() {
                return Admission::WaitUntil(oldest + WINDOW);
            }
        }

        self.window.push_back(now);
        self.in_flight += 1;
        self.used_today += 1;
        Admission::Granted
    }

    /// Return a concurrency slot after a call finishes.
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Undo the most recent grant when nothing was dispatched with it.
    pub fn refund(&mut self) {
        self.window.pop_back();
        self.release();
        self.used_today = self.used_today.saturating_sub(1);
    }

    pub fn remaining_today(&mut self, today: NaiveDate) -> u64 {
        self.roll_day(today);
        self.daily_budget.saturating_sub(self.used_today)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window() {
        let mut quota = QuotaGovernor::new(2, 10, 100);
        let t0 = Instant::now();

        assert_eq!(quota.try_acquire(t0, day(1)), Admission::Granted);
        assert_eq!(
            quota.try_acquire(t0 + Duration::from_millis(300), day(1)),
            Admission::Granted
        );
        assert_eq!(
            quota.try_acquire(t0 + Duration::from_millis(500), day(1)),
            Admission::WaitUntil(t0 + WINDOW)
        );
        // The first grant has left the window
        assert_eq!(quota.try_acquire(t0 + WINDOW, day(1)), Admission::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let mut quota = QuotaGovernor::new(100, 1, 100);
        let now = Instant::now();
        assert_eq!(quota.try_acquire(now, day(1)), Admission::Granted);
        assert_eq!(quota.try_acquire(now, day(1)), Admission::AtCapacity);
        quota.release();
        assert_eq!(quota.try_acquire(now, day(1)), Admission::Granted);
        assert_eq!(quota.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_budget_resets_next_day() {
        let mut quota = QuotaGovernor::new(100, 100, 2);
        let now = Instant::now();
        assert_eq!(quota.try_acquire(now, day(1)), Admission::Granted);
        assert_eq!(quota.try_acquire(now, day(1)), Admission::Granted);
        assert_eq!(quota.try_acquire(now, day(1)), Admission::BudgetExhausted);
        assert_eq!(quota.remaining_today(day(1)), 0);

        assert_eq!(quota.remaining_today(day(2)), 2);
        assert_eq!(quota.try_acquire(now, day(2)), Admission::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_restores_slot() {
        let mut quota = QuotaGovernor::new(1, 1, 1);
        let now = Instant::now();
        assert_eq!(quota.try_acquire(now, day(1)), Admission::Granted);
        quota.refund();
        assert_eq!(quota.remaining_today(day(1)), 1);
        assert_eq!(quota.try_acquire(now, day(1)), Admission::Granted);
    }
}
