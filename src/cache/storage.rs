//! Cache storage traits and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use crate::request::RequestKey;
use crate::response::{ResponseType, StoredResponse};

/// A stored response together with the time it was written.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: StoredResponse,
  pub cached_at: DateTime<Utc>,
}

/// An order waiting for delivery.
#[derive(Debug, Clone)]
pub struct QueuedOrder {
  pub id: i64,
  /// Sent with every delivery attempt so the endpoint can drop duplicates
  pub idempotency_key: String,
  /// JSON body to POST
  pub body: Vec<u8>,
  pub queued_at: DateTime<Utc>,
  pub attempts: u32,
}

/// Trait for versioned response store backends.
///
/// Mirrors the platform cache: named stores, exact request matching,
/// per-key overwrite. Only GET keys should be written.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it doesn't exist.
  fn create_store(&self, name: &str) -> Result<()>;

  /// Store names in creation order.
  fn store_names(&self) -> Result<Vec<String>>;

  fn has_store(&self, name: &str) -> Result<bool>;

  /// Whether the store was completed by `put_all` (a finished install).
  fn is_installed(&self, name: &str) -> Result<bool>;

  /// Delete a store with all its entries. Returns false if it didn't exist.
  fn delete_store(&self, name: &str) -> Result<bool>;

  /// Write one entry, creating the store if needed. Overwrites any prior entry.
  fn put(&self, store: &str, key: &RequestKey, response: &StoredResponse) -> Result<()>;

  /// Create the store, write every entry and mark it installed, in one transaction.
  fn put_all(&self, store: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()>;

  /// Exact lookup in one store.
  fn match_in(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Exact lookup across all stores, oldest store first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Keys held by a store, in write order.
  fn keys(&self, store: &str) -> Result<Vec<RequestKey>>;
}

/// Trait for the deferred delivery queue backend.
pub trait QueueStorage: Send + Sync {
  fn enqueue_order(&self, idempotency_key: &str, body: &[u8]) -> Result<i64>;

  /// Queued orders in enumeration (insertion) order.
  fn queued_orders(&self) -> Result<Vec<QueuedOrder>>;

  fn remove_order(&self, id: i64) -> Result<bool>;

  fn record_attempt(&self, id: i64) -> Result<()>;
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache and queue tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named store; rowid gives creation order
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    -- Set by the install transaction; NULL for stores created by a single put
    installed_at TEXT
);

CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_type TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, method, url),
    FOREIGN KEY (store_name) REFERENCES cache_stores(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_request
    ON cache_entries(method, url);

-- Orders waiting for background delivery
CREATE TABLE IF NOT EXISTS order_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT NOT NULL UNIQUE,
    body BLOB NOT NULL,
    queued_at TEXT NOT NULL DEFAULT (datetime('now')),
    attempts INTEGER NOT NULL DEFAULT 0
);
"#;

const ENTRY_COLUMNS: &str = "e.status, e.headers, e.body, e.response_type, e.cached_at";

fn insert_store(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create store {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  store: &str,
  key: &RequestKey,
  response: &StoredResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (store_name, method, url, status, headers, body, response_type, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        store,
        key.method(),
        key.url().as_str(),
        response.status,
        headers,
        response.body,
        response.response_type.as_str()
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
  Ok(())
}

type RawEntry = (u16, String, Vec<u8>, String, String);

fn read_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_entry(raw: RawEntry) -> Result<CachedResponse> {
  let (status, headers, body, response_type, cached_at) = raw;
  let headers: Vec<(String, String)> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;

  Ok(CachedResponse {
    response: StoredResponse {
      status,
      headers,
      body,
      response_type: ResponseType::parse(&response_type)?,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn create_store(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    insert_store(&conn, name)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn has_store(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![name],
        |_| Ok(()),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up store {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn is_installed(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ? AND installed_at IS NOT NULL",
        params![name],
        |_| Ok(()),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up store {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let deleted = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn put(&self, store: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    let conn = self.lock()?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    insert_store(&tx, store)?;
    insert_entry(&tx, store, key, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_all(&self, store: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
    let conn = self.lock()?;

    // Dropping the transaction without commit rolls back
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_store(&tx, store)?;
    for (key, response) in entries {
      insert_entry(&tx, store, key, response)?;
    }
    tx.execute(
      "UPDATE cache_stores SET installed_at = datetime('now') WHERE name = ?",
      params![store],
    )
    .map_err(|e| eyre!("Failed to mark {} installed: {}", store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_in(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let raw = conn
      .query_row(
        &format!(
          "SELECT {} FROM cache_entries e
           WHERE e.store_name = ? AND e.method = ? AND e.url = ?",
          ENTRY_COLUMNS
        ),
        params![store, key.method(), key.url().as_str()],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    raw.map(decode_entry).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let raw = conn
      .query_row(
        &format!(
          "SELECT {} FROM cache_entries e
           INNER JOIN cache_stores s ON s.name = e.store_name
           WHERE e.method = ? AND e.url = ?
           ORDER BY s.rowid
           LIMIT 1",
          ENTRY_COLUMNS
        ),
        params![key.method(), key.url().as_str()],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    raw.map(decode_entry).transpose()
  }

  fn keys(&self, store: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE store_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![store], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url)| {
        let url = Url::parse(&url).map_err(|e| eyre!("Corrupt cached URL {}: {}", url, e))?;
        RequestKey::new(&method, url.as_str(), &url)
      })
      .collect()
  }
}

impl QueueStorage for SqliteStorage {
  fn enqueue_order(&self, idempotency_key: &str, body: &[u8]) -> Result<i64> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT INTO order_queue (idempotency_key, body, queued_at) VALUES (?, ?, datetime('now'))",
        params![idempotency_key, body],
      )
      .map_err(|e| eyre!("Failed to queue order: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn queued_orders(&self) -> Result<Vec<QueuedOrder>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, idempotency_key, body, queued_at, attempts FROM order_queue ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Vec<u8>>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, u32>(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query order queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued order: {}", e))?;

    rows
      .into_iter()
      .map(|(id, idempotency_key, body, queued_at, attempts)| {
        Ok(QueuedOrder {
          id,
          idempotency_key,
          body,
          queued_at: parse_datetime(&queued_at)?,
          attempts,
        })
      })
      .collect()
  }

  fn remove_order(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;

    let deleted = conn
      .execute("DELETE FROM order_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued order {}: {}", id, e))?;

    Ok(deleted > 0)
  }

  fn record_attempt(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "UPDATE order_queue SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to update queued order {}: {}", id, e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("http://localhost:8080").unwrap()
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::get(path, &origin()).unwrap()
  }

  fn html(body: &str) -> StoredResponse {
    StoredResponse::new(200, body, ResponseType::Basic).with_header("content-type", "text/html")
  }

  #[test]
  fn test_put_then_match_in_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("/index.html"), &html("<p>hi</p>")).unwrap();

    let cached = storage.match_in("v1", &key("/index.html")).unwrap().unwrap();
    assert_eq!(cached.response.text(), "<p>hi</p>");
    assert_eq!(cached.response.header("content-type"), Some("text/html"));
    assert!(storage.has_store("v1").unwrap());
    assert!(storage.match_in("v2", &key("/index.html")).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("/data/ticker.json"), &html("old")).unwrap();
    storage.put("v1", &key("/data/ticker.json"), &html("new")).unwrap();

    let cached = storage.match_in("v1", &key("/data/ticker.json")).unwrap().unwrap();
    assert_eq!(cached.response.text(), "new");
    assert_eq!(storage.keys("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_method_is_part_of_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("/app.js"), &html("js")).unwrap();

    let head = RequestKey::new("HEAD", "/app.js", &origin()).unwrap();
    assert!(storage.match_any(&head).unwrap().is_none());
  }

  #[test]
  fn test_store_names_in_creation_order_and_delete() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.create_store("alo-zoghal-v1.1").unwrap();
    storage.create_store("alo-zoghal-v1.2").unwrap();
    storage.put("alo-zoghal-v1.1", &key("/"), &html("old")).unwrap();

    assert_eq!(
      storage.store_names().unwrap(),
      vec!["alo-zoghal-v1.1".to_string(), "alo-zoghal-v1.2".to_string()]
    );

    assert!(storage.delete_store("alo-zoghal-v1.1").unwrap());
    assert!(!storage.delete_store("alo-zoghal-v1.1").unwrap());
    assert_eq!(storage.store_names().unwrap(), vec!["alo-zoghal-v1.2".to_string()]);
    assert!(storage.match_any(&key("/")).unwrap().is_none());
  }

  #[test]
  fn test_match_any_prefers_oldest_store() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("/app.js"), &html("one")).unwrap();
    storage.put("v2", &key("/app.js"), &html("two")).unwrap();

    let cached = storage.match_any(&key("/app.js")).unwrap().unwrap();
    assert_eq!(cached.response.text(), "one");
  }

  #[test]
  fn test_put_all_writes_every_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (key("/"), html("root")),
      (key("/index.html"), html("index")),
      (key("/data/settings.json"), html("{}")),
    ];
    storage.put_all("v1", &entries).unwrap();

    let keys = storage.keys("v1").unwrap();
    assert_eq!(keys.len(), 3);
    assert_eq!(keys[1], key("/index.html"));
  }

  #[test]
  fn test_only_put_all_marks_store_installed() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("/app.js"), &html("js")).unwrap();
    storage.put_all("v2", &[(key("/"), html("root"))]).unwrap();
    storage.put("v2", &key("/app.js"), &html("js")).unwrap();

    assert!(storage.has_store("v1").unwrap());
    assert!(!storage.is_installed("v1").unwrap());
    assert!(storage.is_installed("v2").unwrap());
    assert!(!storage.is_installed("v3").unwrap());
  }

  #[test]
  fn test_queue_insertion_order_and_removal() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let first = storage.enqueue_order("k1", br#"{"n":1}"#).unwrap();
    let second = storage.enqueue_order("k2", br#"{"n":2}"#).unwrap();

    storage.record_attempt(first).unwrap();
    let orders = storage.queued_orders().unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].idempotency_key, "k1");
    assert_eq!(orders[0].attempts, 1);
    assert_eq!(orders[1].id, second);

    assert!(storage.remove_order(first).unwrap());
    assert_eq!(storage.queued_orders().unwrap().len(), 1);
  }

  #[test]
  fn test_duplicate_idempotency_key_rejected() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.enqueue_order("same", b"{}").unwrap();
    assert!(storage.enqueue_order("same", b"{}").is_err());
  }

  #[test]
  fn test_on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put("v1", &key("/index.html"), &html("persisted")).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let cached = storage.match_in("v1", &key("/index.html")).unwrap().unwrap();
    assert_eq!(cached.response.text(), "persisted");
  }
}
