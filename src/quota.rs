//! Daily quota ledger for the Gmail API
//!
//! Gmail charges "quota units" per operation rather than per request. The
//! [`QuotaTracker`] keeps a running total against the daily allowance and
//! resets it lazily the first time it is consulted after UTC midnight.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Cost charged for operations missing from the table
pub const DEFAULT_OPERATION_COST: u64 = 5;

/// Default daily allowance in quota units
pub const DEFAULT_DAILY_LIMIT: u64 = 1_000_000_000;

fn default_costs() -> HashMap<&'static str, u64> {
    HashMap::from([
        ("list_messages", 5),
        ("get_message", 5),
        ("get_profile", 1),
        ("list_labels", 1),
        ("modify_message", 5),
        ("trash_message", 5),
        ("untrash_message", 5),
        ("delete_message", 10),
        ("batch_modify", 50),
        ("batch_delete", 50),
        ("history_list", 2),
    ])
}

/// Next UTC midnight strictly after `now`
fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now + ChronoDuration::days(1))
}

/// Snapshot returned by [`QuotaTracker::quota_status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub daily_limit: u64,
    pub daily_used: u64,
    pub daily_remaining: u64,
    pub usage_percentage: f64,
    pub reset_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct QuotaTracker {
    daily_limit: u64,
    daily_used: u64,
    reset_at: DateTime<Utc>,
    costs: HashMap<&'static str, u64>,
}

impl QuotaTracker {
    pub fn new(daily_limit: u64) -> Self {
        Self::starting_at(daily_limit, Utc::now())
    }

    fn starting_at(daily_limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            daily_limit,
            daily_used: 0,
            reset_at: next_midnight(now),
            costs: default_costs(),
        }
    }

    /// Cost of `count` invocations of `operation`
    pub fn cost_of(&self, operation: &str, count: u64) -> u64 {
        self.costs
            .get(operation)
            .copied()
            .unwrap_or(DEFAULT_OPERATION_COST)
            .saturating_mul(count)
    }

    fn reset_if_due(&mut self, now: DateTime<Utc>) {
        if now >= self.reset_at {
            info!(
                "Quota day rolled over, resetting {} used units",
                self.daily_used
            );
            self.daily_used = 0;
            self.reset_at = next_midnight(now);
        }
    }

    /// Whether `count` calls of `operation` fit in today's remaining budget
    pub fn check_quota_available(&mut self, operation: &str, count: u64) -> bool {
        self.check_quota_available_at(operation, count, Utc::now())
    }

    fn check_quota_available_at(&mut self, operation: &str, count: u64, now: DateTime<Utc>) -> bool {
        self.reset_if_due(now);
        let cost = self.cost_of(operation, count);
        let available = self.daily_used.saturating_add(cost) <= self.daily_limit;
        if !available {
            debug!(
                "Quota check failed for {} x{}: {} + {} > {}",
                operation, count, self.daily_used, cost, self.daily_limit
            );
        }
        available
    }

    /// Book `count` calls of `operation`.
    ///
    /// Does not re-check the limit; callers ask
    /// [`check_quota_available`](Self::check_quota_available) first.
    pub fn consume_quota(&mut self, operation: &str, count: u64) {
        let cost = self.cost_of(operation, count);
        self.daily_used = self.daily_used.saturating_add(cost);
        debug!(
            "Consumed {} quota units for {} x{} ({} used today)",
            cost, operation, count, self.daily_used
        );
    }

    pub fn quota_status(&self) -> QuotaStatus {
        let remaining = self.daily_limit.saturating_sub(self.daily_used);
        let usage_percentage = if self.daily_limit == 0 {
            100.0
        } else {
            self.daily_used as f64 / self.daily_limit as f64 * 100.0
        };

        QuotaStatus {
            daily_limit: self.daily_limit,
            daily_used: self.daily_used,
            daily_remaining: remaining,
            usage_percentage,
            reset_time: self.reset_at,
        }
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DAILY_LIMIT)
    }
}

/// Quota tracker shared between concurrent tasks
#[derive(Debug, Clone)]
pub struct SharedQuotaTracker {
    inner: Arc<Mutex<QuotaTracker>>,
}

impl SharedQuotaTracker {
    pub fn new(tracker: QuotaTracker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tracker)),
        }
    }

    pub async fn check_quota_available(&self, operation: &str, count: u64) -> bool {
        self.inner
            .lock()
            .await
            .check_quota_available(operation, count)
    }

    pub async fn consume_quota(&self, operation: &str, count: u64) {
        self.inner.lock().await.consume_quota(operation, count);
    }

    /// Check and book under one lock; returns false without booking when the budget is short
    pub async fn try_consume(&self, operation: &str, count: u64) -> bool {
        let mut tracker = self.inner.lock().await;
        if tracker.check_quota_available(operation, count) {
            tracker.consume_quota(operation, count);
            true
        } else {
            false
        }
    }

    pub async fn quota_status(&self) -> QuotaStatus {
        self.inner.lock().await.quota_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_consumption_adds_per_operation_cost() {
        let mut tracker = QuotaTracker::new(10_000);
        tracker.consume_quota("list_messages", 10);
        tracker.consume_quota("get_message", 20);
        assert_eq!(tracker.quota_status().daily_used, 150);
    }

    #[test]
    fn test_unknown_operation_costs_default() {
        let tracker = QuotaTracker::new(100);
        assert_eq!(tracker.cost_of("send_message", 1), DEFAULT_OPERATION_COST);
        assert_eq!(tracker.cost_of("delete_message", 3), 30);
        assert_eq!(tracker.cost_of("batch_delete", 1), 50);
    }

    #[test]
    fn test_check_respects_limit() {
        let mut tracker = QuotaTracker::new(100);
        assert!(tracker.check_quota_available("batch_modify", 2));
        assert!(!tracker.check_quota_available("batch_modify", 3));

        tracker.consume_quota("batch_modify", 1);
        assert!(tracker.check_quota_available("batch_modify", 1));
        assert!(!tracker.check_quota_available("get_message", 11));
    }

    #[test]
    fn test_consume_trusts_caller() {
        let mut tracker = QuotaTracker::new(10);
        tracker.consume_quota("delete_message", 5);

        let status = tracker.quota_status();
        assert_eq!(status.daily_used, 50);
        assert_eq!(status.daily_remaining, 0);
        assert!(status.usage_percentage > 100.0);
    }

    #[test]
    fn test_resets_once_after_midnight() {
        let start = Utc.with_ymd_and_hms(2024, 3, 15, 23, 0, 0).unwrap();
        let mut tracker = QuotaTracker::starting_at(1_000, start);
        tracker.consume_quota("batch_delete", 10);
        assert_eq!(tracker.quota_status().daily_used, 500);
        assert_eq!(
            tracker.quota_status().reset_time,
            Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap()
        );

        let before = Utc.with_ymd_and_hms(2024, 3, 15, 23, 59, 59).unwrap();
        assert!(tracker.check_quota_available_at("get_message", 1, before));
        assert_eq!(tracker.quota_status().daily_used, 500);

        let after = Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 1).unwrap();
        assert!(tracker.check_quota_available_at("get_message", 1, after));
        assert_eq!(tracker.quota_status().daily_used, 0);
        assert_eq!(
            tracker.quota_status().reset_time,
            Utc.with_ymd_and_hms(2024, 3, 17, 0, 0, 0).unwrap()
        );

        tracker.consume_quota("get_message", 1);
        let later = Utc.with_ymd_and_hms(2024, 3, 16, 12, 0, 0).unwrap();
        tracker.check_quota_available_at("get_message", 1, later);
        assert_eq!(tracker.quota_status().daily_used, 5);
    }

    #[test]
    fn test_status_is_read_only() {
        let mut tracker = QuotaTracker::new(200);
        tracker.consume_quota("get_message", 10);

        let first = tracker.quota_status();
        let second = tracker.quota_status();
        assert_eq!(first, second);
        assert_eq!(first.daily_remaining, 150);
        assert!((first.usage_percentage - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_shared_tracker_try_consume() {
        let shared = SharedQuotaTracker::new(QuotaTracker::new(60));
        assert!(shared.try_consume("batch_modify", 1).await);
        assert!(!shared.try_consume("batch_modify", 1).await);
        assert!(shared.try_consume("get_message", 2).await);
        assert_eq!(shared.quota_status().await.daily_used, 60);
    }
}
