//! Domain documents for the accounting engine.
//!
//! These mirror the shapes the mobile/web clients write to the cloud
//! document store: camelCase field names, optional/omitted fields, and
//! timestamps arriving in three different shapes (RFC3339 string,
//! `{seconds[, nanoseconds]}` map, or epoch milliseconds). The timestamp
//! union is normalized to `DateTime<Utc>` at the deserialization boundary
//! and never propagates further.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// The three wire shapes clients use for timestamps.
#[derive(Debug, Clone)]
pub enum TimestampValue {
    /// RFC3339 / ISO-8601 string, e.g. `"2024-02-10T05:59:00Z"`.
    Iso(String),
    /// Firestore-style `{ seconds, nanoseconds }` map.
    Seconds { seconds: i64, nanoseconds: u32 },
    /// Epoch milliseconds (JS `Date.getTime()`).
    Millis(i64),
}

impl TimestampValue {
    /// Extract a timestamp shape from a loose JSON value. Returns `None`
    /// for shapes we do not recognize (malformed data degrades to "no
    /// timestamp", it never fails deserialization of the whole document).
    pub fn from_value(v: &serde_json::Value) -> Option<TimestampValue> {
        match v {
            serde_json::Value::String(s) => Some(TimestampValue::Iso(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(TimestampValue::Millis),
            serde_json::Value::Object(map) => {
                let seconds = map.get("seconds").and_then(|s| s.as_i64())?;
                let nanoseconds = map
                    .get("nanoseconds")
                    .or_else(|| map.get("nanos"))
                    .and_then(|n| n.as_u64())
                    .unwrap_or(0) as u32;
                Some(TimestampValue::Seconds {
                    seconds,
                    nanoseconds,
                })
            }
            _ => None,
        }
    }

    /// Normalize to the canonical representation. `None` when the value
    /// cannot be interpreted (unparsable string, out-of-range epoch).
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            TimestampValue::Iso(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.with_timezone(&Utc))
                .or_else(|| s.parse::<DateTime<Utc>>().ok()),
            TimestampValue::Seconds {
                seconds,
                nanoseconds,
            } => Utc.timestamp_opt(*seconds, *nanoseconds).single(),
            TimestampValue::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
        }
    }
}

/// Deserialize any of the three timestamp shapes into `Option<DateTime<Utc>>`.
/// Unrecognized or unparsable values become `None` rather than an error.
fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(TimestampValue::from_value)
        .and_then(|t| t.to_utc()))
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// Order lifecycle states. Terminal at `Delivered` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    WaitingMerchant,
    Preparing,
    Ready,
    Pending,
    InTransit,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// Lenient status normalization. Clients have written several spellings
    /// over time (`inTransit`, `on_the_way`, `canceled`, ...); unknown
    /// strings fall back to `Pending` so a bad document never poisons an
    /// aggregate with a phantom delivery.
    pub fn parse(raw: &str) -> OrderStatus {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "waiting_merchant" | "waitingmerchant" | "waiting" => OrderStatus::WaitingMerchant,
            "preparing" | "accepted" | "in_preparation" => OrderStatus::Preparing,
            "ready" | "ready_for_pickup" => OrderStatus::Ready,
            "in_transit" | "intransit" | "on_the_way" | "delivering" | "out_for_delivery" => {
                OrderStatus::InTransit
            }
            "delivered" | "completed" | "complete" => OrderStatus::Delivered,
            "cancelled" | "canceled" | "rejected" => OrderStatus::Cancelled,
            _ => OrderStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }
}

impl Default for OrderStatus {
    fn default() -> Self {
        OrderStatus::Pending
    }
}

impl<'de> Deserialize<'de> for OrderStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(OrderStatus::parse(&raw))
    }
}

/// A delivery transaction as stored in the `orders` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// `ORD-<n>` for standard orders, `S-<n>` for shopping orders.
    pub id: String,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub total_price: f64,
    #[serde(default)]
    pub delivery_fee: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set only when status transitions to Delivered.
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// One-way flag: archived orders never return to the live set.
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_month: Option<String>,
    /// True once the driver's commission for this order has been settled.
    #[serde(default)]
    pub reconciled: bool,
}

impl Order {
    /// Live orders are everything the monthly close has not yet swept.
    pub fn is_live(&self) -> bool {
        !self.is_archived
    }

    pub fn is_delivered(&self) -> bool {
        self.status == OrderStatus::Delivered
    }

    /// Numeric suffix of the id when it carries the given prefix
    /// (`"ORD-7"` with prefix `"ORD-"` -> `Some(7)`).
    pub fn numeric_suffix(&self, prefix: &str) -> Option<u64> {
        self.id.strip_prefix(prefix)?.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// Users / drivers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Supervisor,
    Merchant,
    Driver,
    Customer,
}

impl Default for UserRole {
    fn default() -> Self {
        UserRole::Customer
    }
}

/// How a driver's per-order commission (owed to the platform) is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionType {
    /// Flat currency amount per delivered order.
    Fixed,
    /// Percent of the order's delivery fee.
    Percentage,
}

/// A user document. Commission fields are only meaningful for drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_type: Option<CommissionType>,
    #[serde(default)]
    pub commission_rate: f64,
}

impl UserProfile {
    pub fn is_driver(&self) -> bool {
        self.role == UserRole::Driver
    }
}

// ---------------------------------------------------------------------------
// Monthly report
// ---------------------------------------------------------------------------

/// Two-phase report lifecycle: written as `Pending`, flipped to `Committed`
/// once every live order has been marked archived. A pending report is the
/// marker that lets a crashed close be resumed instead of duplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportState {
    Pending,
    Committed,
}

/// A driver's unpaid balance at the moment the books were closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_name: Option<String>,
    /// Delivered, non-reconciled orders counted into this snapshot.
    pub order_count: i64,
    pub delivery_fees: f64,
    pub commission: f64,
    /// `delivery_fees - commission`: what the platform owes the driver.
    pub balance: f64,
}

/// Immutable snapshot produced by one "close the books" operation.
///
/// Created exactly once per archival; never mutated (beyond the
/// pending -> committed state flip) or deleted by this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReport {
    pub id: String,
    /// Human month label, e.g. `"August 2026"`. Also stamped onto every
    /// archived order as `archiveMonth`.
    pub label: String,
    pub generated_at: DateTime<Utc>,
    pub generated_by: String,
    pub state: ReportState,
    pub total_orders: i64,
    pub delivered_count: i64,
    pub cancelled_count: i64,
    pub other_count: i64,
    /// Sum of `totalPrice` over delivered orders.
    pub total_revenue: f64,
    /// Sum of `deliveryFee` over delivered orders.
    pub total_delivery_fees: f64,
    /// Aggregate commission under the paid-dailies rule.
    pub total_app_profit: f64,
    /// 15% of `total_app_profit`.
    pub admin_share: f64,
    /// `total_delivery_fees - total_app_profit`.
    pub total_driver_payouts: f64,
    /// Highest `ORD-<n>` in the archived set, `"ORD-0"` if none.
    pub last_regular_order_id: String,
    /// Highest `S-<n>` in the archived set, `"S-0"` if none.
    pub last_shopping_order_id: String,
    /// Driver id -> unpaid-balance snapshot at archival time.
    #[serde(default)]
    pub wallet_snapshots: BTreeMap<String, WalletSnapshot>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_timestamp_iso_shape() {
        let v = serde_json::json!("2024-02-10T05:59:00Z");
        let ts = TimestampValue::from_value(&v).unwrap().to_utc().unwrap();
        assert_eq!(ts.hour(), 5);
        assert_eq!(ts.minute(), 59);
    }

    #[test]
    fn test_timestamp_seconds_shape() {
        let v = serde_json::json!({ "seconds": 1707544740, "nanoseconds": 0 });
        let ts = TimestampValue::from_value(&v).unwrap().to_utc().unwrap();
        assert_eq!(ts.timestamp(), 1707544740);
    }

    #[test]
    fn test_timestamp_millis_shape() {
        let v = serde_json::json!(1707544740000_i64);
        let ts = TimestampValue::from_value(&v).unwrap().to_utc().unwrap();
        assert_eq!(ts.timestamp(), 1707544740);
    }

    #[test]
    fn test_timestamp_garbage_degrades_to_none() {
        assert!(TimestampValue::from_value(&serde_json::json!(true)).is_none());
        let unparsable = TimestampValue::Iso("not-a-date".into());
        assert!(unparsable.to_utc().is_none());
    }

    #[test]
    fn test_status_lenient_parse() {
        assert_eq!(OrderStatus::parse("inTransit"), OrderStatus::InTransit);
        assert_eq!(OrderStatus::parse("on_the_way"), OrderStatus::InTransit);
        assert_eq!(OrderStatus::parse("canceled"), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::parse("COMPLETED"), OrderStatus::Delivered);
        assert_eq!(OrderStatus::parse("waiting merchant"), OrderStatus::WaitingMerchant);
        // Unknown strings never become a phantom delivery
        assert_eq!(OrderStatus::parse("???"), OrderStatus::Pending);
    }

    #[test]
    fn test_order_deserializes_from_client_document() {
        let doc = serde_json::json!({
            "id": "ORD-12",
            "status": "delivered",
            "totalPrice": 80.0,
            "deliveryFee": 15.0,
            "driverId": "drv-1",
            "createdAt": { "seconds": 1707544740 },
            "deliveredAt": "2024-02-10T07:30:00Z",
            "reconciled": false
        });
        let order: Order = serde_json::from_value(doc).unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
        assert_eq!(order.delivery_fee, 15.0);
        assert!(order.is_live());
        assert_eq!(order.numeric_suffix("ORD-"), Some(12));
        assert_eq!(order.numeric_suffix("S-"), None);
    }

    #[test]
    fn test_order_missing_fields_take_defaults() {
        let order: Order = serde_json::from_value(serde_json::json!({ "id": "S-3" })).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_price, 0.0);
        assert!(order.created_at.is_none());
        assert!(!order.is_archived);
    }

    #[test]
    fn test_user_profile_roundtrip() {
        let doc = serde_json::json!({
            "id": "drv-1",
            "name": "Sam",
            "role": "driver",
            "commissionType": "percentage",
            "commissionRate": 20.0
        });
        let user: UserProfile = serde_json::from_value(doc).unwrap();
        assert!(user.is_driver());
        assert_eq!(user.commission_type, Some(CommissionType::Percentage));
        let back = serde_json::to_value(&user).unwrap();
        assert_eq!(back["commissionType"], "percentage");
    }
}
