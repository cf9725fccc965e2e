//! Dispatch Books - delivery back-office accounting engine.
//!
//! Backend logic for a multi-role delivery-order application: per-order and
//! aggregate commission splits, 06:00-to-06:00 business-day bucketing, and
//! the monthly "close the books" archival that snapshots live aggregates
//! into a permanent report.
//!
//! Screens and transports live elsewhere; everything here operates on plain
//! document collections (`orders`, `users`, `monthly_reports`) behind the
//! [`store::Store`] abstraction.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod archive;
pub mod busdate;
pub mod commission;
pub mod model;
pub mod orders;
pub mod store;

/// Collection names as stored in the backing document store.
pub const ORDERS_COLLECTION: &str = "orders";
pub const USERS_COLLECTION: &str = "users";
pub const REPORTS_COLLECTION: &str = "monthly_reports";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Engine-level error taxonomy.
///
/// Computation problems (unparsable timestamps, missing driver records) do
/// not appear here: they degrade to exclusion/zero inside the calculators
/// instead of failing the whole operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Close-the-books invoked with zero live orders. Nothing was written.
    #[error("no live orders to archive")]
    NoLiveOrders,

    #[error("{0}")]
    Validation(String),

    #[error("store: {0}")]
    Persistence(String),
}

// ---------------------------------------------------------------------------
// Loose-JSON field helpers
// ---------------------------------------------------------------------------

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Initialize structured logging (console + daily-rolling file).
///
/// `log_dir` is created if missing; file output is plain text without ANSI
/// escapes. Call once at startup — subsequent calls return an error from
/// the subscriber registry.
pub fn init_logging(log_dir: &std::path::Path) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dispatch_books=debug"));

    std::fs::create_dir_all(log_dir).map_err(|e| format!("create log dir: {e}"))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "dispatch-books");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("init logging: {e}"))?;

    // Keep the guard alive for the lifetime of the process — dropping it
    // flushes and stops the background writer.
    std::mem::forget(guard);

    info!("Logging initialized (v{})", env!("CARGO_PKG_VERSION"));
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
