//! Monthly archival — the "close the books" operation.
//!
//! Snapshots the live order set into an immutable [`MonthlyReport`] and
//! marks every live order archived, resetting the live views. The two
//! persistent writes are not transactional across the store boundary, so
//! the report goes through a two-phase lifecycle: written as `pending`,
//! flipped to `committed` after the batch order-update finishes. A crash
//! in between leaves a recent pending report that the next invocation
//! resumes (re-scanning `isArchived != true` and sweeping the remainder)
//! instead of creating a duplicate.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};
use uuid::Uuid;

use crate::commission::{self, CommissionSettings};
use crate::model::{
    MonthlyReport, Order, ReportState, UserProfile, UserRole, WalletSnapshot,
};
use crate::orders::{self, REGULAR_PREFIX, SHOPPING_PREFIX};
use crate::store::Store;
use crate::{EngineError, ORDERS_COLLECTION, REPORTS_COLLECTION, USERS_COLLECTION};

/// A pending report younger than this is treated as an interrupted close
/// and resumed rather than duplicated.
pub const RECENT_REPORT_WINDOW_MINUTES: i64 = 10;

/// What a completed close did.
#[derive(Debug)]
pub struct ArchiveOutcome {
    pub report: MonthlyReport,
    pub archived_orders: usize,
    /// True when an interrupted pending report was picked up instead of a
    /// new one being created.
    pub resumed: bool,
}

// ---------------------------------------------------------------------------
// Pure computation
// ---------------------------------------------------------------------------

/// Build the financial snapshot for the given live order set.
///
/// No persistence here: callers own the collections and pass them in, so
/// the arithmetic is testable without a store. Errors with
/// [`EngineError::NoLiveOrders`] when there is nothing to close.
pub fn build_monthly_report(
    live_orders: &[Order],
    users: &[UserProfile],
    settings: &CommissionSettings,
    now: DateTime<Utc>,
    actor_id: &str,
) -> Result<MonthlyReport, EngineError> {
    let live: Vec<&Order> = live_orders.iter().filter(|o| o.is_live()).collect();
    if live.is_empty() {
        return Err(EngineError::NoLiveOrders);
    }

    let drivers_by_id: HashMap<String, UserProfile> = users
        .iter()
        .filter(|u| u.role == UserRole::Driver)
        .map(|u| (u.id.clone(), u.clone()))
        .collect();

    let buckets = orders::partition_by_status(&live);

    let total_revenue: f64 = buckets.delivered.iter().map(|o| o.total_price).sum();
    let total_delivery_fees: f64 = buckets.delivered.iter().map(|o| o.delivery_fee).sum();

    let live_owned: Vec<Order> = live.iter().map(|o| (**o).clone()).collect();
    let total_app_profit = commission::aggregate_commission(&live_owned, &drivers_by_id, settings);
    let admin_share = commission::admin_share(total_app_profit);
    let total_driver_payouts = total_delivery_fees - total_app_profit;

    // Unpaid balance per driver appearing in delivered orders. A delivered
    // order referencing a driver we have no record for still snapshots its
    // fees, with commission 0.
    let mut wallet_snapshots: BTreeMap<String, WalletSnapshot> = BTreeMap::new();
    for order in &buckets.delivered {
        let Some(driver_id) = order.driver_id.as_deref() else {
            continue;
        };
        let driver = drivers_by_id.get(driver_id);
        let entry = wallet_snapshots
            .entry(driver_id.to_string())
            .or_insert_with(|| WalletSnapshot {
                driver_name: driver.and_then(|d| d.name.clone()),
                order_count: 0,
                delivery_fees: 0.0,
                commission: 0.0,
                balance: 0.0,
            });
        if order.reconciled {
            continue;
        }
        entry.order_count += 1;
        entry.delivery_fees += order.delivery_fee;
        entry.commission += commission::order_commission(order, driver);
    }
    for snapshot in wallet_snapshots.values_mut() {
        snapshot.balance = snapshot.delivery_fees - snapshot.commission;
    }

    let report = MonthlyReport {
        id: format!(
            "MR-{}-{}",
            now.format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        ),
        label: now.format("%B %Y").to_string(),
        generated_at: now,
        generated_by: actor_id.to_string(),
        state: ReportState::Pending,
        total_orders: live.len() as i64,
        delivered_count: buckets.delivered.len() as i64,
        cancelled_count: buckets.cancelled.len() as i64,
        other_count: buckets.other.len() as i64,
        total_revenue,
        total_delivery_fees,
        total_app_profit,
        admin_share,
        total_driver_payouts,
        last_regular_order_id: orders::last_order_id(&live_owned, REGULAR_PREFIX),
        last_shopping_order_id: orders::last_order_id(&live_owned, SHOPPING_PREFIX),
        wallet_snapshots,
    };
    Ok(report)
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Close the books over whatever is live right now.
pub fn archive_current_period(
    store: &Store,
    settings: &CommissionSettings,
    actor_id: &str,
) -> Result<ArchiveOutcome, EngineError> {
    archive_current_period_at(store, settings, actor_id, Utc::now())
}

/// Close the books with an explicit clock (exposed for deterministic tests
/// of the resume window).
pub fn archive_current_period_at(
    store: &Store,
    settings: &CommissionSettings,
    actor_id: &str,
    now: DateTime<Utc>,
) -> Result<ArchiveOutcome, EngineError> {
    let raw = store
        .load_collection(ORDERS_COLLECTION)
        .map_err(EngineError::Persistence)?;
    let all = orders::parse_orders(&raw);
    let live: Vec<Order> = all.into_iter().filter(|o| o.is_live()).collect();

    // Double-invocation guard: a fresh pending report means a previous
    // close wrote its snapshot but never finished. Checked before the
    // empty-live guard — a crash after the sweep completed but before the
    // commit flip leaves nothing live, yet the flip still has to happen.
    let existing = list_monthly_reports(store)?;
    let window = Duration::minutes(RECENT_REPORT_WINDOW_MINUTES);
    let resumable = existing
        .into_iter()
        .find(|r| r.state == ReportState::Pending && now - r.generated_at <= window);

    if live.is_empty() {
        let Some(pending) = resumable else {
            // Explicit no-op: nothing written, the caller must hear about it.
            return Err(EngineError::NoLiveOrders);
        };
        // The interrupted close already archived every order; only the
        // commit flip was lost.
        store
            .update_data(
                REPORTS_COLLECTION,
                &pending.id,
                &serde_json::json!({ "state": "committed" }),
            )
            .map_err(EngineError::Persistence)?;
        info!(
            report_id = %pending.id,
            label = %pending.label,
            "Committed fully-swept pending report"
        );
        let mut report = pending;
        report.state = ReportState::Committed;
        return Ok(ArchiveOutcome {
            report,
            archived_orders: 0,
            resumed: true,
        });
    }

    let users = load_users(store)?;

    let (report, resumed) = match resumable {
        Some(pending) => {
            info!(
                report_id = %pending.id,
                generated_at = %pending.generated_at,
                "Resuming interrupted close instead of creating a duplicate report"
            );
            (pending, true)
        }
        None => {
            let report = build_monthly_report(&live, &users, settings, now, actor_id)?;
            let doc = serde_json::to_value(&report)
                .map_err(|e| EngineError::Persistence(format!("serialize report: {e}")))?;
            // Write #1: the snapshot, pending until the sweep finishes.
            store
                .add_data(REPORTS_COLLECTION, &report.id, &doc)
                .map_err(EngineError::Persistence)?;
            (report, false)
        }
    };

    // Write #2: mark every live order archived. On a resumed close only
    // orders the pending snapshot could have counted are swept — anything
    // created after the report was generated stays live for the next
    // close. Re-marking an already archived order is a safe no-op, which
    // is what makes retry sound.
    let sweep: Vec<&Order> = if resumed {
        live.iter()
            .filter(|o| o.created_at.map_or(true, |t| t <= report.generated_at))
            .collect()
    } else {
        live.iter().collect()
    };
    let patches: Vec<(String, serde_json::Value)> = sweep
        .iter()
        .map(|o| {
            (
                o.id.clone(),
                serde_json::json!({ "isArchived": true, "archiveMonth": report.label }),
            )
        })
        .collect();
    let archived_orders = store
        .batch_save_data(ORDERS_COLLECTION, &patches)
        .map_err(EngineError::Persistence)?;

    // Commit: only now is the close complete.
    store
        .update_data(
            REPORTS_COLLECTION,
            &report.id,
            &serde_json::json!({ "state": "committed" }),
        )
        .map_err(EngineError::Persistence)?;

    info!(
        report_id = %report.id,
        label = %report.label,
        archived_orders = archived_orders,
        total_revenue = report.total_revenue,
        total_app_profit = report.total_app_profit,
        resumed = resumed,
        "Books closed"
    );

    let mut report = report;
    report.state = ReportState::Committed;
    Ok(ArchiveOutcome {
        report,
        archived_orders,
        resumed,
    })
}

// ---------------------------------------------------------------------------
// Report access
// ---------------------------------------------------------------------------

/// Fetch one report. Malformed stored documents read as absent.
pub fn get_monthly_report(store: &Store, id: &str) -> Result<Option<MonthlyReport>, EngineError> {
    let doc = store
        .get_data(REPORTS_COLLECTION, id)
        .map_err(EngineError::Persistence)?;
    Ok(doc.and_then(|d| match serde_json::from_value(d) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(report_id = %id, error = %e, "Malformed monthly report document");
            None
        }
    }))
}

/// All reports, newest first.
pub fn list_monthly_reports(store: &Store) -> Result<Vec<MonthlyReport>, EngineError> {
    let raw = store
        .load_collection(REPORTS_COLLECTION)
        .map_err(EngineError::Persistence)?;
    let mut reports: Vec<MonthlyReport> = raw
        .into_iter()
        .filter_map(|doc| match serde_json::from_value(doc) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Skipping malformed monthly report document");
                None
            }
        })
        .collect();
    reports.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
    Ok(reports)
}

fn load_users(store: &Store) -> Result<Vec<UserProfile>, EngineError> {
    let raw = store
        .load_collection(USERS_COLLECTION)
        .map_err(EngineError::Persistence)?;
    Ok(raw
        .into_iter()
        .filter_map(|doc| match serde_json::from_value::<UserProfile>(doc) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Skipping malformed user document");
                None
            }
        })
        .collect())
}

// ===========================================================================
// Tests
// ===========================================================================
