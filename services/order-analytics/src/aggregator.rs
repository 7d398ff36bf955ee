//! Metrics aggregator
//!
//! Holds the single authoritative `MetricsState` and serializes every
//! mutation and snapshot through one lock. Each `apply_*` call updates all
//! the fields it touches inside one critical section, so a concurrent
//! `snapshot()` sees either none or all of a call's effects.
//!
//! Accounting notes:
//! - Revenue is never reversed: a cancelled order still counts toward
//!   `total_orders` and `total_revenue`.
//! - `orders_by_status` counts are clamped at zero and need not sum to
//!   `total_orders` (orders may never announce an initial status).
//! - Hour buckets are kept forever unless `hour_retention` is set.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use types::ids::{OrderId, UserId};
use types::numeric::{Amount, AmountError};

/// Layout of hour bucket keys, e.g. `2024-01-01-10`.
pub const HOUR_KEY_FORMAT: &str = "%Y-%m-%d-%H";

/// Truncate a timestamp to its hour bucket key.
pub fn hour_key(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(HOUR_KEY_FORMAT).to_string()
}

/// Configuration for the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AggregatorConfig {
    /// Keep only the newest N hour buckets. `None` keeps all of them.
    #[serde(default)]
    pub hour_retention: Option<usize>,
}

/// The mutable aggregate. Only reachable through `MetricsAggregator`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsState {
    pub total_orders: u64,
    pub total_revenue: Amount,
    pub orders_by_status: BTreeMap<String, u64>,
    /// Created events per hour bucket, keys sort chronologically
    pub orders_per_hour: BTreeMap<String, u64>,
    pub cancelled_orders: u64,
}

/// Point-in-time copy of `MetricsState` plus the derived average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub total_orders: u64,
    pub total_revenue: Amount,
    pub orders_by_status: BTreeMap<String, u64>,
    pub avg_order_value: Amount,
    pub orders_per_hour: BTreeMap<String, u64>,
    pub cancelled_orders: u64,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    fn from_state(state: &MetricsState, taken_at: DateTime<Utc>) -> Self {
        Self {
            total_orders: state.total_orders,
            total_revenue: state.total_revenue,
            orders_by_status: state.orders_by_status.clone(),
            avg_order_value: state.total_revenue.per(state.total_orders),
            orders_per_hour: state.orders_per_hour.clone(),
            cancelled_orders: state.cancelled_orders,
            taken_at,
        }
    }
}

/// Owner of the aggregate state.
///
/// Constructed once at service init and shared by handle (`Arc`) with the
/// router, the broadcaster and the query layer.
pub struct MetricsAggregator {
    state: RwLock<MetricsState>,
    config: AggregatorConfig,
}

impl MetricsAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        info!(
            hour_retention = ?config.hour_retention,
            "MetricsAggregator initialized"
        );
        Self {
            state: RwLock::new(MetricsState::default()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AggregatorConfig::default())
    }

    /// Count a new order: order total, revenue and hour bucket together.
    ///
    /// An amount that would overflow the running revenue is rejected and
    /// leaves the state untouched.
    pub fn apply_created(
        &self,
        order_id: &OrderId,
        user_id: &UserId,
        amount: Amount,
        timestamp: DateTime<Utc>,
    ) -> Result<(), AmountError> {
        let bucket = hour_key(&timestamp);
        let mut state = self.state.write();

        let revenue = state.total_revenue.checked_add(amount)?;
        state.total_orders += 1;
        state.total_revenue = revenue;
        *state.orders_per_hour.entry(bucket.clone()).or_insert(0) += 1;

        if let Some(keep) = self.config.hour_retention {
            while state.orders_per_hour.len() > keep {
                state.orders_per_hour.pop_first();
            }
        }

        debug!(
            order_id = %order_id,
            user_id = %user_id,
            amount = %amount,
            bucket = %bucket,
            total_orders = state.total_orders,
            "Applied order created"
        );
        Ok(())
    }

    /// Move one order between status buckets.
    ///
    /// A missing or empty `old_status` skips the decrement. Decrementing a
    /// bucket that is already zero (or absent) leaves it at zero.
    pub fn apply_status_changed(&self, old_status: Option<&str>, new_status: &str) {
        let mut state = self.state.write();

        if let Some(old) = old_status.filter(|s| !s.is_empty()) {
            let count = state.orders_by_status.entry(old.to_string()).or_insert(0);
            *count = count.saturating_sub(1);
        }
        *state
            .orders_by_status
            .entry(new_status.to_string())
            .or_insert(0) += 1;

        debug!(
            old_status = old_status.unwrap_or(""),
            new_status,
            "Applied status change"
        );
    }

    pub fn apply_cancelled(&self) {
        let mut state = self.state.write();
        state.cancelled_orders += 1;
    }

    /// Consistent copy of the current state.
    ///
    /// Holds the read lock only long enough to clone the maps.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        Snapshot::from_state(&state, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn created(agg: &MetricsAggregator, amount: u64, at: DateTime<Utc>) {
        agg.apply_created(
            &OrderId::new("o"),
            &UserId::new("u"),
            Amount::from_u64(amount),
            at,
        )
        .unwrap();
    }

    #[test]
    fn test_reference_sequence() {
        let agg = MetricsAggregator::with_defaults();

        created(&agg, 10, ts(10, 5));
        created(&agg, 20, ts(10, 50));
        agg.apply_status_changed(Some("PENDING"), "CONFIRMED");
        agg.apply_cancelled();

        let snap = agg.snapshot();
        assert_eq!(snap.total_orders, 2);
        assert_eq!(snap.total_revenue, Amount::from_u64(30));
        assert_eq!(snap.avg_order_value, Amount::from_u64(15));
        assert_eq!(snap.orders_per_hour.len(), 1);
        assert_eq!(snap.orders_per_hour["2024-01-01-10"], 2);
        assert_eq!(snap.orders_by_status["PENDING"], 0);
        assert_eq!(snap.orders_by_status["CONFIRMED"], 1);
        assert_eq!(snap.cancelled_orders, 1);
    }

    #[test]
    fn test_empty_snapshot_average_is_zero() {
        let snap = MetricsAggregator::with_defaults().snapshot();
        assert_eq!(snap.total_orders, 0);
        assert_eq!(snap.avg_order_value, Amount::ZERO);
    }

    #[test]
    fn test_status_change_without_old_status() {
        let agg = MetricsAggregator::with_defaults();
        agg.apply_status_changed(None, "PENDING");
        agg.apply_status_changed(Some(""), "PENDING");

        let snap = agg.snapshot();
        assert_eq!(snap.orders_by_status.len(), 1);
        assert_eq!(snap.orders_by_status["PENDING"], 2);
    }

    #[test]
    fn test_status_decrement_clamped() {
        let agg = MetricsAggregator::with_defaults();
        agg.apply_status_changed(None, "PENDING");
        agg.apply_status_changed(Some("PENDING"), "CONFIRMED");
        agg.apply_status_changed(Some("PENDING"), "CONFIRMED");

        let snap = agg.snapshot();
        assert_eq!(snap.orders_by_status["PENDING"], 0);
        assert_eq!(snap.orders_by_status["CONFIRMED"], 2);
    }

    #[test]
    fn test_cancel_does_not_reverse_revenue() {
        let agg = MetricsAggregator::with_defaults();
        created(&agg, 50, ts(9, 0));
        agg.apply_cancelled();

        let snap = agg.snapshot();
        assert_eq!(snap.total_orders, 1);
        assert_eq!(snap.total_revenue, Amount::from_u64(50));
        assert_eq!(snap.cancelled_orders, 1);
    }

    #[test]
    fn test_revenue_overflow_rejected_atomically() {
        let agg = MetricsAggregator::with_defaults();
        let huge: Amount = "5e28".parse().unwrap();
        let apply = |amount| {
            agg.apply_created(&OrderId::new("o"), &UserId::new("u"), amount, ts(10, 0))
        };

        assert!(apply(huge).is_ok());
        assert_eq!(apply(huge), Err(AmountError::Overflow));
        assert!(apply(Amount::from_u64(7)).is_ok());

        let snap = agg.snapshot();
        assert_eq!(snap.total_orders, 2);
        assert_eq!(snap.orders_per_hour["2024-01-01-10"], 2);
        assert_eq!(snap.total_revenue, huge.checked_add(Amount::from_u64(7)).unwrap());
    }

    #[test]
    fn test_hour_retention_keeps_newest() {
        let agg = MetricsAggregator::new(AggregatorConfig {
            hour_retention: Some(2),
        });
        created(&agg, 1, ts(8, 0));
        created(&agg, 1, ts(9, 0));
        created(&agg, 1, ts(10, 0));

        let snap = agg.snapshot();
        let keys: Vec<&String> = snap.orders_per_hour.keys().collect();
        assert_eq!(keys, vec!["2024-01-01-09", "2024-01-01-10"]);
        assert_eq!(snap.total_orders, 3);
    }

    #[test]
    fn test_snapshot_serialization_shape() {
        let agg = MetricsAggregator::with_defaults();
        created(&agg, 10, ts(10, 5));
        let json = serde_json::to_value(agg.snapshot()).unwrap();

        assert_eq!(json["totalOrders"], 1);
        assert_eq!(json["totalRevenue"], 10.0);
        assert_eq!(json["avgOrderValue"], 10.0);
        assert_eq!(json["ordersPerHour"]["2024-01-01-10"], 1);
        assert!(json["ordersByStatus"].is_object());
    }

    #[test]
    fn test_concurrent_snapshots_never_torn() {
        let agg = Arc::new(MetricsAggregator::with_defaults());
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let agg = Arc::clone(&agg);
                thread::spawn(move || {
                    for i in 0..2_000u32 {
                        created(&agg, 3, ts((w * 5 + i % 5) % 24, 0));
                        if i % 7 == 0 {
                            agg.apply_status_changed(Some("PENDING"), "CONFIRMED");
                        }
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let agg = Arc::clone(&agg);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut observed = 0;
                    while !done.load(Ordering::Acquire) {
                        let snap = agg.snapshot();
                        let bucket_total: u64 = snap.orders_per_hour.values().sum();
                        assert_eq!(bucket_total, snap.total_orders);
                        assert_eq!(snap.total_revenue, Amount::from_u64(3 * snap.total_orders));
                        observed += 1;
                    }
                    observed
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
        for r in readers {
            r.join().unwrap();
        }

        let snap = agg.snapshot();
        assert_eq!(snap.total_orders, 8_000);
        assert_eq!(snap.total_revenue, Amount::from_u64(24_000));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Created(u32),
        Status(Option<String>, String),
        Cancelled,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let status = prop_oneof![
            Just("PENDING".to_string()),
            Just("CONFIRMED".to_string()),
            Just("SHIPPED".to_string()),
        ];
        prop_oneof![
            (0u32..100_000).prop_map(Op::Created),
            (proptest::option::of(status.clone()), status)
                .prop_map(|(old, new)| Op::Status(old, new)),
            Just(Op::Cancelled),
        ]
    }

    proptest! {
        #[test]
        fn prop_totals_match_created_events(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let agg = MetricsAggregator::with_defaults();
            let mut expected_revenue = Amount::ZERO;
            let mut expected_orders = 0u64;
            let mut expected_cancelled = 0u64;

            for op in &ops {
                match op {
                    Op::Created(cents) => {
                        let amount = Amount::new(rust_decimal::Decimal::new(*cents as i64, 2));
                        agg.apply_created(&OrderId::new("o"), &UserId::new("u"), amount, ts(12, 0))
                            .unwrap();
                        expected_revenue += amount;
                        expected_orders += 1;
                    }
                    Op::Status(old, new) => agg.apply_status_changed(old.as_deref(), new),
                    Op::Cancelled => {
                        agg.apply_cancelled();
                        expected_cancelled += 1;
                    }
                }
            }

            let snap = agg.snapshot();
            prop_assert_eq!(snap.total_orders, expected_orders);
            prop_assert_eq!(snap.total_revenue, expected_revenue);
            prop_assert_eq!(snap.cancelled_orders, expected_cancelled);
        }

        #[test]
        fn prop_status_counts_bounded_by_increments(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let agg = MetricsAggregator::with_defaults();
            let mut increments: BTreeMap<String, u64> = BTreeMap::new();

            for op in &ops {
                if let Op::Status(old, new) = op {
                    agg.apply_status_changed(old.as_deref(), new);
                    *increments.entry(new.clone()).or_insert(0) += 1;
                }
            }

            let snap = agg.snapshot();
            for (status, count) in &snap.orders_by_status {
                let max = increments.get(status).copied().unwrap_or(0);
                prop_assert!(*count <= max);
            }
        }
    }
}
