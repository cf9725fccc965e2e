//! Live-set bookkeeping: order-number sequencing, status partitioning,
//! reconciliation, and per-day summaries.
//!
//! Order ids are issued monotonically per prefix (`ORD-<n>` standard,
//! `S-<n>` shopping). The monthly close truncates the live set, so the
//! highest suffix per prefix is snapshotted into the report and numbering
//! resumes from there.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::busdate;
use crate::model::{Order, OrderStatus};
use crate::store::Store;
use crate::{EngineError, ORDERS_COLLECTION};

/// Standard delivery orders.
pub const REGULAR_PREFIX: &str = "ORD-";
/// "Shopping" orders (driver buys on the customer's behalf).
pub const SHOPPING_PREFIX: &str = "S-";

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

/// Highest numeric suffix among ids carrying `prefix`, if any.
pub fn max_suffix(orders: &[Order], prefix: &str) -> Option<u64> {
    orders.iter().filter_map(|o| o.numeric_suffix(prefix)).max()
}

/// Last-used order id for a prefix, `"<prefix>0"` when the collection has
/// no orders of that prefix.
pub fn last_order_id(orders: &[Order], prefix: &str) -> String {
    format!("{prefix}{}", max_suffix(orders, prefix).unwrap_or(0))
}

/// Next id in the sequence for a prefix.
pub fn next_order_id(orders: &[Order], prefix: &str) -> String {
    format!("{prefix}{}", max_suffix(orders, prefix).unwrap_or(0) + 1)
}

// ---------------------------------------------------------------------------
// Live set
// ---------------------------------------------------------------------------

/// Everything the monthly close has not swept (`isArchived != true`).
pub fn live_orders(all: &[Order]) -> Vec<&Order> {
    all.iter().filter(|o| o.is_live()).collect()
}

pub struct StatusBuckets<'a> {
    pub delivered: Vec<&'a Order>,
    pub cancelled: Vec<&'a Order>,
    pub other: Vec<&'a Order>,
}

/// Partition into delivered / cancelled / everything in flight.
pub fn partition_by_status<'a>(orders: &[&'a Order]) -> StatusBuckets<'a> {
    let mut buckets = StatusBuckets {
        delivered: Vec::new(),
        cancelled: Vec::new(),
        other: Vec::new(),
    };
    for &order in orders {
        match order.status {
            OrderStatus::Delivered => buckets.delivered.push(order),
            OrderStatus::Cancelled => buckets.cancelled.push(order),
            _ => buckets.other.push(order),
        }
    }
    buckets
}

/// Parse raw store documents into orders, skipping (and logging) documents
/// that do not deserialize. One bad document must not take down a view.
pub fn parse_orders(raw: &[serde_json::Value]) -> Vec<Order> {
    raw.iter()
        .filter_map(|doc| match serde_json::from_value::<Order>(doc.clone()) {
            Ok(order) => Some(order),
            Err(e) => {
                let id = crate::value_str(doc, &["id"]).unwrap_or_else(|| "?".into());
                warn!(order_id = %id, error = %e, "Skipping malformed order document");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Mark a delivered order's commission as settled.
///
/// Validation only requires that the order exists and is delivered;
/// re-reconciling is a harmless no-op.
pub fn mark_reconciled(store: &Store, order_id: &str) -> Result<(), EngineError> {
    let doc = store
        .get_data(ORDERS_COLLECTION, order_id)
        .map_err(EngineError::Persistence)?
        .ok_or_else(|| EngineError::Validation(format!("Order not found: {order_id}")))?;

    let order: Order = serde_json::from_value(doc)
        .map_err(|e| EngineError::Validation(format!("Malformed order {order_id}: {e}")))?;
    if !order.is_delivered() {
        return Err(EngineError::Validation(format!(
            "Only delivered orders can be reconciled (order {order_id} is {:?})",
            order.status
        )));
    }

    store
        .update_data(
            ORDERS_COLLECTION,
            order_id,
            &serde_json::json!({ "reconciled": true }),
        )
        .map_err(EngineError::Persistence)?;

    info!(order_id = %order_id, "Order commission reconciled");
    Ok(())
}

// ---------------------------------------------------------------------------
// Daily summaries
// ---------------------------------------------------------------------------

/// Per-business-day totals for the reporting screens, newest day first.
/// Only live orders are counted — archived history belongs to its monthly
/// report. Cancelled orders count toward the order count but not the money
/// totals; undated orders are excluded entirely.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: NaiveDate,
    pub order_count: i64,
    pub delivered_count: i64,
    pub revenue: f64,
    pub delivery_fees: f64,
}

pub fn daily_summaries(orders: &[Order]) -> Vec<DailySummary> {
    let live: Vec<Order> = orders.iter().filter(|o| o.is_live()).cloned().collect();
    let buckets = busdate::group_by_business_date(&live);
    let mut summaries: Vec<DailySummary> = buckets
        .into_iter()
        .map(|(date, day_orders)| {
            let delivered: Vec<&&Order> =
                day_orders.iter().filter(|o| o.is_delivered()).collect();
            DailySummary {
                date,
                order_count: day_orders.len() as i64,
                delivered_count: delivered.len() as i64,
                revenue: delivered.iter().map(|o| o.total_price).sum(),
                delivery_fees: delivered.iter().map(|o| o.delivery_fee).sum(),
            }
        })
        .collect();
    summaries.reverse();
    summaries
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn order(id: &str, status: OrderStatus) -> Order {
        Order {
            id: id.to_string(),
            status,
            total_price: 100.0,
            delivery_fee: 10.0,
            driver_id: None,
            created_at: None,
            delivered_at: None,
            is_archived: false,
            archive_month: None,
            reconciled: false,
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().expect("test timestamp")
    }

    #[test]
    fn test_last_order_id_per_prefix() {
        let orders: Vec<Order> = ["ORD-1", "ORD-3", "ORD-7", "S-2", "S-9"]
            .iter()
            .map(|id| order(id, OrderStatus::Delivered))
            .collect();

        assert_eq!(last_order_id(&orders, REGULAR_PREFIX), "ORD-7");
        assert_eq!(last_order_id(&orders, SHOPPING_PREFIX), "S-9");
    }

    #[test]
    fn test_last_order_id_defaults_to_zero() {
        let orders: Vec<Order> = vec![order("ORD-4", OrderStatus::Pending)];
        assert_eq!(last_order_id(&orders, SHOPPING_PREFIX), "S-0");
        assert_eq!(last_order_id(&[], REGULAR_PREFIX), "ORD-0");
    }

    #[test]
    fn test_next_order_id_resumes_after_max() {
        let orders: Vec<Order> = ["ORD-1", "ORD-7"]
            .iter()
            .map(|id| order(id, OrderStatus::Pending))
            .collect();
        assert_eq!(next_order_id(&orders, REGULAR_PREFIX), "ORD-8");
        assert_eq!(next_order_id(&[], REGULAR_PREFIX), "ORD-1");
    }

    #[test]
    fn test_suffix_ignores_non_numeric_ids() {
        let orders = vec![
            order("ORD-5", OrderStatus::Pending),
            order("ORD-legacy", OrderStatus::Pending),
        ];
        assert_eq!(max_suffix(&orders, REGULAR_PREFIX), Some(5));
    }

    #[test]
    fn test_live_orders_excludes_archived() {
        let mut archived = order("ORD-1", OrderStatus::Delivered);
        archived.is_archived = true;
        let all = vec![archived, order("ORD-2", OrderStatus::Pending)];
        let live = live_orders(&all);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "ORD-2");
    }

    #[test]
    fn test_partition_by_status() {
        let all = vec![
            order("ORD-1", OrderStatus::Delivered),
            order("ORD-2", OrderStatus::Cancelled),
            order("ORD-3", OrderStatus::InTransit),
            order("ORD-4", OrderStatus::Delivered),
        ];
        let refs: Vec<&Order> = all.iter().collect();
        let buckets = partition_by_status(&refs);
        assert_eq!(buckets.delivered.len(), 2);
        assert_eq!(buckets.cancelled.len(), 1);
        assert_eq!(buckets.other.len(), 1);
    }

    #[test]
    fn test_parse_orders_skips_malformed() {
        let raw = vec![
            serde_json::json!({ "id": "ORD-1", "status": "delivered" }),
            serde_json::json!({ "status": 42 }), // no id, wrong type
        ];
        let parsed = parse_orders(&raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "ORD-1");
    }

    #[test]
    fn test_mark_reconciled() {
        let store = Store::open_in_memory().unwrap();
        store
            .add_data(
                ORDERS_COLLECTION,
                "ORD-1",
                &serde_json::json!({ "id": "ORD-1", "status": "delivered", "deliveryFee": 10.0 }),
            )
            .unwrap();

        mark_reconciled(&store, "ORD-1").unwrap();
        let doc = store.get_data(ORDERS_COLLECTION, "ORD-1").unwrap().unwrap();
        assert_eq!(doc["reconciled"], true);
        // other fields untouched by the merge-patch
        assert_eq!(doc["deliveryFee"], 10.0);

        // Idempotent
        mark_reconciled(&store, "ORD-1").unwrap();
    }

    #[test]
    fn test_mark_reconciled_rejects_undelivered() {
        let store = Store::open_in_memory().unwrap();
        store
            .add_data(
                ORDERS_COLLECTION,
                "ORD-1",
                &serde_json::json!({ "id": "ORD-1", "status": "in_transit" }),
            )
            .unwrap();

        let err = mark_reconciled(&store, "ORD-1").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = mark_reconciled(&store, "ORD-404").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_daily_summaries() {
        let mut day1_delivered = order("ORD-1", OrderStatus::Delivered);
        day1_delivered.created_at = Some(ts("2024-02-09T12:00:00Z"));
        let mut day1_cancelled = order("ORD-2", OrderStatus::Cancelled);
        day1_cancelled.created_at = Some(ts("2024-02-10T03:00:00Z")); // pre-rollover: still Feb 9
        let mut day2 = order("ORD-3", OrderStatus::Delivered);
        day2.created_at = Some(ts("2024-02-10T09:00:00Z"));

        let summaries = daily_summaries(&[day1_delivered, day1_cancelled, day2]);
        assert_eq!(summaries.len(), 2);

        // Newest first
        assert_eq!(summaries[0].date, NaiveDate::from_ymd_opt(2024, 2, 10).unwrap());
        assert_eq!(summaries[0].order_count, 1);

        let day1 = &summaries[1];
        assert_eq!(day1.order_count, 2);
        assert_eq!(day1.delivered_count, 1);
        assert_eq!(day1.revenue, 100.0);
        assert_eq!(day1.delivery_fees, 10.0);
    }

    #[test]
    fn test_daily_summaries_exclude_archived() {
        let mut live = order("ORD-1", OrderStatus::Delivered);
        live.created_at = Some(ts("2024-02-10T09:00:00Z"));
        let mut archived = order("ORD-2", OrderStatus::Delivered);
        archived.created_at = Some(ts("2024-02-09T09:00:00Z"));
        archived.is_archived = true;

        // Passing the full collection must not leak archived history into
        // the daily totals.
        let summaries = daily_summaries(&[live, archived]);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].date, NaiveDate::from_ymd_opt(2024, 2, 10).unwrap());
        assert_eq!(summaries[0].revenue, 100.0);
    }
}
