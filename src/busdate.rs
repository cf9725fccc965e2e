//! Business-day bucketing.
//!
//! Delivery "days" run 06:00-06:00 rather than midnight-to-midnight: a
//! 02:00 order belongs to the previous evening's shift, so daily summaries
//! and the "today" view group by business date, not calendar date.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use std::collections::BTreeMap;

use crate::model::Order;

/// Hour at which one business day rolls into the next.
pub const ROLLOVER_HOUR: u32 = 6;

/// Business date of a timestamp: timestamps before 06:00 belong to the
/// previous calendar day.
pub fn business_date_of(ts: DateTime<Utc>) -> NaiveDate {
    let date = ts.date_naive();
    if ts.hour() < ROLLOVER_HOUR {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}

/// Business date of an order's `createdAt`. `None` when the order has no
/// parsable creation timestamp — such orders are excluded from date-bucketed
/// views, they never fail the computation.
pub fn order_business_date(order: &Order) -> Option<NaiveDate> {
    order.created_at.map(business_date_of)
}

/// Group orders by business date, oldest bucket first. Orders without a
/// parsable `createdAt` are dropped.
pub fn group_by_business_date(orders: &[Order]) -> BTreeMap<NaiveDate, Vec<&Order>> {
    let mut buckets: BTreeMap<NaiveDate, Vec<&Order>> = BTreeMap::new();
    for order in orders {
        if let Some(date) = order_business_date(order) {
            buckets.entry(date).or_default().push(order);
        }
    }
    buckets
}

/// Split orders into (today, previous days) relative to `now`'s business
/// date. Undated orders land in neither set.
pub fn partition_today<'a>(
    orders: &'a [Order],
    now: DateTime<Utc>,
) -> (Vec<&'a Order>, Vec<&'a Order>) {
    let today = business_date_of(now);
    let mut today_set = Vec::new();
    let mut previous = Vec::new();
    for order in orders {
        match order_business_date(order) {
            Some(date) if date == today => today_set.push(order),
            Some(_) => previous.push(order),
            None => {}
        }
    }
    (today_set, previous)
}

// ===========================================================================
// Tests
// ===========================================================================
