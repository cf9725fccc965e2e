//! SQLite-backed document store.
//!
//! The engine's only persistence boundary: schemaless collections of JSON
//! documents with add / merge-patch update / chunked batch save / delete,
//! plus push-style subscriptions that deliver the full collection snapshot
//! after every mutation. Uses rusqlite with WAL mode; one `documents`
//! table keyed by (collection, id) holds everything.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

/// Backend batch-size limit: merge-patches are committed in chunks of at
/// most this many documents per transaction.
pub const BATCH_CHUNK_SIZE: usize = 400;

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Callback invoked with the full collection snapshot on every change.
pub type SnapshotCallback = Box<dyn Fn(&[Value]) + Send>;

struct Subscriber {
    id: u64,
    callback: SnapshotCallback,
}

/// Document store handle. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct Store {
    conn: Mutex<Connection>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    pub db_path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store at `{data_dir}/books.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs pending migrations. On corruption or open failure, deletes
    /// the file and retries once.
    pub fn open(data_dir: &Path) -> Result<Store, String> {
        fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

        let db_path = data_dir.join("books.db");
        info!("Opening document store at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Store open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)
                    .map_err(|e| format!("Store open failed after retry: {e}"))?
            }
        };

        run_migrations(&conn)?;
        info!("Document store initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Store {
            conn: Mutex::new(conn),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            db_path: Some(db_path),
        })
    }

    /// In-memory store for tests and previews.
    pub fn open_in_memory() -> Result<Store, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| format!("pragma setup: {e}"))?;
        run_migrations(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            db_path: None,
        })
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Create one document with a caller-supplied id. Fails if the id
    /// already exists in the collection.
    pub fn add_data(&self, collection: &str, id: &str, data: &Value) -> Result<(), String> {
        {
            let conn = self.conn.lock().map_err(|e| e.to_string())?;
            let doc = with_id(data, id);
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO documents (collection, id, data) VALUES (?1, ?2, ?3)",
                    params![collection, id, doc.to_string()],
                )
                .map_err(|e| format!("add {collection}/{id}: {e}"))?;
            if inserted == 0 {
                return Err(format!("Document already exists: {collection}/{id}"));
            }
        }
        self.notify(collection);
        Ok(())
    }

    /// Merge-patch one document: existing fields not named in `patch` are
    /// preserved; the document is created if missing.
    pub fn update_data(&self, collection: &str, id: &str, patch: &Value) -> Result<(), String> {
        {
            let conn = self.conn.lock().map_err(|e| e.to_string())?;
            upsert_merged(&conn, collection, id, patch)?;
        }
        self.notify(collection);
        Ok(())
    }

    /// Merge-patch many documents in one logical operation, committed in
    /// chunks of [`BATCH_CHUNK_SIZE`]. Subscribers are notified once, after
    /// the final chunk. Returns the number of documents written.
    pub fn batch_save_data(
        &self,
        collection: &str,
        records: &[(String, Value)],
    ) -> Result<usize, String> {
        if records.is_empty() {
            return Ok(0);
        }
        {
            let conn = self.conn.lock().map_err(|e| e.to_string())?;
            for chunk in records.chunks(BATCH_CHUNK_SIZE) {
                conn.execute_batch("BEGIN IMMEDIATE")
                    .map_err(|e| format!("begin batch: {e}"))?;
                let result = chunk
                    .iter()
                    .try_for_each(|(id, patch)| upsert_merged(&conn, collection, id, patch));
                match result {
                    Ok(()) => conn
                        .execute_batch("COMMIT")
                        .map_err(|e| format!("commit batch: {e}"))?,
                    Err(e) => {
                        let _ = conn.execute_batch("ROLLBACK");
                        return Err(e);
                    }
                }
            }
        }
        info!(
            collection = collection,
            count = records.len(),
            "Batch save complete"
        );
        self.notify(collection);
        Ok(records.len())
    }

    /// Remove one document. Deleting a missing document is a no-op.
    pub fn delete_data(&self, collection: &str, id: &str) -> Result<(), String> {
        {
            let conn = self.conn.lock().map_err(|e| e.to_string())?;
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .map_err(|e| format!("delete {collection}/{id}: {e}"))?;
        }
        self.notify(collection);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Fetch one document, `None` if absent.
    pub fn get_data(&self, collection: &str, id: &str) -> Result<Option<Value>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("get {collection}/{id}: {e}"))?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Fetch the full collection, ordered by document id.
    pub fn load_collection(&self, collection: &str) -> Result<Vec<Value>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare("SELECT data FROM documents WHERE collection = ?1 ORDER BY id")
            .map_err(|e| format!("prepare load: {e}"))?;
        let rows = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))
            .map_err(|e| format!("load {collection}: {e}"))?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect())
    }

    pub fn collection_len(&self, collection: &str) -> Result<usize, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(|e| format!("count {collection}: {e}"))?;
        Ok(count as usize)
    }

    // -----------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------

    /// Register a snapshot callback for a collection. The callback fires
    /// immediately with the current snapshot, then after every mutation.
    /// Returns a subscription id for [`Store::unsubscribe`].
    ///
    /// Callbacks run under the registry lock: do not subscribe or
    /// unsubscribe from inside one.
    pub fn subscribe_to_collection(&self, collection: &str, callback: SnapshotCallback) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.load_collection(collection).unwrap_or_default();
        callback(&snapshot);
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.entry(collection.to_string())
            .or_default()
            .push(Subscriber { id, callback });
        id
    }

    /// Drop a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, collection: &str, subscription_id: u64) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subs.get_mut(collection) {
            list.retain(|s| s.id != subscription_id);
        }
    }

    fn notify(&self, collection: &str) {
        let snapshot = match self.load_collection(collection) {
            Ok(s) => s,
            Err(e) => {
                warn!(collection = collection, error = %e, "Snapshot load failed, skipping notify");
                return;
            }
        };
        let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subs.get(collection) {
            for sub in list {
                (sub.callback)(&snapshot);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    if current < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

/// Migration v1: the documents table.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| format!("migration v1: {e}"))
}

/// Ensure the stored document carries its own id field.
fn with_id(data: &Value, id: &str) -> Value {
    let mut doc = data.clone();
    if let Value::Object(ref mut map) = doc {
        map.entry("id".to_string())
            .or_insert_with(|| Value::String(id.to_string()));
    }
    doc
}

/// Recursive merge-patch: object fields merge key-by-key, everything else
/// (including null) overwrites.
fn merge_patch(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_val) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_patch(existing, patch_val),
                    None => {
                        base_map.insert(key.clone(), patch_val.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn upsert_merged(conn: &Connection, collection: &str, id: &str, patch: &Value) -> Result<(), String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("read {collection}/{id}: {e}"))?;

    let merged = match existing.and_then(|s| serde_json::from_str::<Value>(&s).ok()) {
        Some(mut base) => {
            merge_patch(&mut base, patch);
            base
        }
        None => with_id(patch, id),
    };

    conn.execute(
        "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, id) DO UPDATE SET
            data = excluded.data,
            updated_at = datetime('now')",
        params![collection, id, merged.to_string()],
    )
    .map_err(|e| format!("upsert {collection}/{id}: {e}"))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
