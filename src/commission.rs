//! Commission calculator.
//!
//! A driver owes the platform a cut of every delivered order: a flat amount
//! per order (`fixed`) or a percentage of the delivery fee (`percentage`).
//! Aggregates follow the "paid dailies" convention: an order whose computed
//! commission is exactly 0 does not contribute to app profit, even though
//! the per-order figure (0) is correct. All arithmetic stays in raw f64;
//! rounding happens at display time only.

use std::collections::HashMap;

use crate::model::{CommissionType, Order, UserProfile};

/// Platform's fixed share of app profit.
pub const ADMIN_SHARE_RATE: f64 = 0.15;

/// Aggregation knobs.
///
/// `count_zero_fixed_rate` resolves an ambiguity in how a fixed-commission
/// driver deliberately configured at rate 0 should be treated: excluded
/// from aggregates like zero-fee percentage orders (default), or counted
/// as a legitimately-zero contributor. Either way the sum is unchanged;
/// the flag only affects which orders are considered "contributing".
#[derive(Debug, Clone, Copy, Default)]
pub struct CommissionSettings {
    pub count_zero_fixed_rate: bool,
}

/// Commission for a single order.
///
/// Returns 0 when no driver is assigned, the driver record is missing or
/// has no commission configuration, or the order is not Delivered. Never
/// negative: misconfigured negative rates clamp to 0.
pub fn order_commission(order: &Order, driver: Option<&UserProfile>) -> f64 {
    if !order.is_delivered() || order.driver_id.is_none() {
        return 0.0;
    }
    let Some(driver) = driver else {
        return 0.0;
    };
    let amount = match driver.commission_type {
        Some(CommissionType::Fixed) => driver.commission_rate,
        Some(CommissionType::Percentage) => order.delivery_fee * (driver.commission_rate / 100.0),
        None => 0.0,
    };
    amount.max(0.0)
}

/// Whether an order's commission counts toward aggregate app profit.
pub fn contributes_to_profit(
    order: &Order,
    driver: Option<&UserProfile>,
    settings: &CommissionSettings,
) -> bool {
    if !order.is_delivered() || order.is_archived {
        return false;
    }
    let commission = order_commission(order, driver);
    if commission > 0.0 {
        return true;
    }
    // 0 commission: only a deliberately-configured 0 fixed rate may count,
    // and only when the caller opted in.
    settings.count_zero_fixed_rate
        && driver.map_or(false, |d| {
            d.commission_type == Some(CommissionType::Fixed) && d.commission_rate == 0.0
        })
        && order.driver_id.is_some()
}

/// Aggregate app profit over Delivered, non-archived orders ("paid
/// dailies" rule: zero-commission orders are excluded).
pub fn aggregate_commission(
    orders: &[Order],
    drivers_by_id: &HashMap<String, UserProfile>,
    settings: &CommissionSettings,
) -> f64 {
    orders
        .iter()
        .filter(|o| o.is_delivered() && !o.is_archived)
        .map(|o| {
            let driver = o.driver_id.as_deref().and_then(|id| drivers_by_id.get(id));
            (o, driver)
        })
        .filter(|(o, driver)| contributes_to_profit(o, *driver, settings))
        .map(|(o, driver)| order_commission(o, driver))
        .sum()
}

/// The platform admin's 15% cut of app profit.
pub fn admin_share(app_profit: f64) -> f64 {
    app_profit * ADMIN_SHARE_RATE
}

/// A driver's unpaid balance: delivery fees minus commission over their
/// delivered, non-reconciled, live orders. This is what the wallet
/// snapshot captures at archival time.
pub fn unpaid_balance(driver_id: &str, orders: &[Order], driver: &UserProfile) -> f64 {
    orders
        .iter()
        .filter(|o| {
            o.is_delivered()
                && !o.is_archived
                && !o.reconciled
                && o.driver_id.as_deref() == Some(driver_id)
        })
        .map(|o| o.delivery_fee - order_commission(o, Some(driver)))
        .sum()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderStatus, UserRole};

    fn delivered(id: &str, delivery_fee: f64, driver_id: Option<&str>) -> Order {
        Order {
            id: id.to_string(),
            status: OrderStatus::Delivered,
            total_price: delivery_fee * 4.0,
            delivery_fee,
            driver_id: driver_id.map(|s| s.to_string()),
            created_at: None,
            delivered_at: None,
            is_archived: false,
            archive_month: None,
            reconciled: false,
        }
    }

    fn driver(id: &str, kind: CommissionType, rate: f64) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            name: Some(id.to_string()),
            role: UserRole::Driver,
            commission_type: Some(kind),
            commission_rate: rate,
        }
    }

    #[test]
    fn test_fixed_commission_ignores_delivery_fee() {
        let d = driver("drv-1", CommissionType::Fixed, 10.0);
        for fee in [0.0, 5.0, 50.0, 500.0] {
            let o = delivered("ORD-1", fee, Some("drv-1"));
            assert_eq!(order_commission(&o, Some(&d)), 10.0);
        }
    }

    #[test]
    fn test_percentage_commission() {
        let d = driver("drv-1", CommissionType::Percentage, 20.0);
        let o = delivered("ORD-1", 50.0, Some("drv-1"));
        assert_eq!(order_commission(&o, Some(&d)), 10.0);
    }

    #[test]
    fn test_no_driver_or_not_delivered_is_zero() {
        let d = driver("drv-1", CommissionType::Fixed, 10.0);

        let unassigned = delivered("ORD-1", 50.0, None);
        assert_eq!(order_commission(&unassigned, Some(&d)), 0.0);

        let mut in_transit = delivered("ORD-2", 50.0, Some("drv-1"));
        in_transit.status = OrderStatus::InTransit;
        assert_eq!(order_commission(&in_transit, Some(&d)), 0.0);

        // Delivered order referencing a driver we have no record for
        let orphan = delivered("ORD-3", 50.0, Some("drv-missing"));
        assert_eq!(order_commission(&orphan, None), 0.0);
    }

    #[test]
    fn test_negative_rate_clamps_to_zero() {
        let d = driver("drv-1", CommissionType::Fixed, -5.0);
        let o = delivered("ORD-1", 50.0, Some("drv-1"));
        assert_eq!(order_commission(&o, Some(&d)), 0.0);
    }

    #[test]
    fn test_zero_commission_excluded_from_aggregate() {
        let mut drivers = HashMap::new();
        drivers.insert(
            "pct".to_string(),
            driver("pct", CommissionType::Percentage, 20.0),
        );

        // Zero delivery fee -> commission exactly 0 -> excluded; the other
        // order contributes 20% of 50.
        let orders = vec![
            delivered("ORD-1", 0.0, Some("pct")),
            delivered("ORD-2", 50.0, Some("pct")),
        ];
        let settings = CommissionSettings::default();
        assert_eq!(aggregate_commission(&orders, &drivers, &settings), 10.0);
        assert!(!contributes_to_profit(&orders[0], drivers.get("pct"), &settings));
    }

    #[test]
    fn test_zero_fixed_rate_policy_is_configurable() {
        let zero_fixed = driver("z", CommissionType::Fixed, 0.0);
        let o = delivered("ORD-1", 40.0, Some("z"));

        let default_settings = CommissionSettings::default();
        assert!(!contributes_to_profit(&o, Some(&zero_fixed), &default_settings));

        let opted_in = CommissionSettings {
            count_zero_fixed_rate: true,
        };
        assert!(contributes_to_profit(&o, Some(&zero_fixed), &opted_in));
    }

    #[test]
    fn test_archived_orders_excluded_from_aggregate() {
        let mut drivers = HashMap::new();
        drivers.insert("f".to_string(), driver("f", CommissionType::Fixed, 10.0));

        let mut archived = delivered("ORD-1", 50.0, Some("f"));
        archived.is_archived = true;
        let live = delivered("ORD-2", 50.0, Some("f"));

        let total =
            aggregate_commission(&[archived, live], &drivers, &CommissionSettings::default());
        assert_eq!(total, 10.0);
    }

    #[test]
    fn test_admin_share_is_fifteen_percent() {
        assert_eq!(admin_share(100.0), 15.0);
        assert_eq!(admin_share(0.0), 0.0);
    }

    #[test]
    fn test_unpaid_balance() {
        let d = driver("drv-1", CommissionType::Fixed, 5.0);
        let mut reconciled = delivered("ORD-3", 30.0, Some("drv-1"));
        reconciled.reconciled = true;
        let orders = vec![
            delivered("ORD-1", 40.0, Some("drv-1")),
            delivered("ORD-2", 60.0, Some("drv-1")),
            reconciled,                              // settled, excluded
            delivered("ORD-4", 25.0, Some("drv-2")), // someone else's
        ];
        // (40 + 60) - (5 + 5)
        assert_eq!(unpaid_balance("drv-1", &orders, &d), 90.0);
    }
}
