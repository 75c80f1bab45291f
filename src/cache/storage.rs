//! Named store trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{Request, Response};

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Overview of one named store.
#[derive(Debug, Clone)]
pub struct StoreSummary {
  pub name: String,
  pub entries: usize,
  pub created_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores, each mapping request identity
/// to the most recently stored response. Every operation is a single atomic
/// step from the caller's point of view.
pub trait CacheStorage: Send + Sync {
  /// Create the store if it does not exist yet.
  fn open(&self, store: &str) -> Result<()>;

  /// Whether a store with this name exists.
  fn has(&self, store: &str) -> Result<bool>;

  /// Names of all stores, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns false if it did not exist.
  fn delete(&self, store: &str) -> Result<bool>;

  /// Store a response, creating the store lazily.
  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()>;

  /// Look up a request in one store.
  fn get(&self, store: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Per-store entry counts.
  fn summaries(&self) -> Result<Vec<StoreSummary>>;

  /// Look up a request in `stores`, in order. The first hit wins.
  fn match_in(&self, stores: &[&str], request: &Request) -> Result<Option<CachedResponse>> {
    for name in stores {
      if let Some(hit) = self.get(name, request)? {
        return Ok(Some(hit));
      }
    }

    Ok(None)
  }
}

struct MemoryStore {
  name: String,
  created_at: DateTime<Utc>,
  entries: HashMap<String, CachedResponse>,
}

impl MemoryStore {
  fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      created_at: Utc::now(),
      entries: HashMap::new(),
    }
  }
}

/// Process-local storage. Used for `--ephemeral` runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<Vec<MemoryStore>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_stores<R>(&self, f: impl FnOnce(&mut Vec<MemoryStore>) -> R) -> Result<R> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut stores))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, store: &str) -> Result<()> {
    self.with_stores(|stores| {
      if !stores.iter().any(|s| s.name == store) {
        stores.push(MemoryStore::new(store));
      }
    })
  }

  fn has(&self, store: &str) -> Result<bool> {
    self.with_stores(|stores| stores.iter().any(|s| s.name == store))
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.with_stores(|stores| stores.iter().map(|s| s.name.clone()).collect())
  }

  fn delete(&self, store: &str) -> Result<bool> {
    self.with_stores(|stores| {
      let before = stores.len();
      stores.retain(|s| s.name != store);
      stores.len() != before
    })
  }

  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()> {
    self.with_stores(|stores| {
      let idx = match stores.iter().position(|s| s.name == store) {
        Some(idx) => idx,
        None => {
          stores.push(MemoryStore::new(store));
          stores.len() - 1
        }
      };
      stores[idx].entries.insert(
        request.cache_key(),
        CachedResponse {
          response: response.clone(),
          cached_at: Utc::now(),
        },
      );
    })
  }

  fn get(&self, store: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let key = request.cache_key();
    self.with_stores(|stores| {
      stores
        .iter()
        .find(|s| s.name == store)
        .and_then(|s| s.entries.get(&key).cloned())
    })
  }

  fn summaries(&self) -> Result<Vec<StoreSummary>> {
    self.with_stores(|stores| {
      stores
        .iter()
        .map(|s| StoreSummary {
          name: s.name.clone(),
          entries: s.entries.len(),
          created_at: s.created_at,
        })
        .collect()
    })
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Storage backed by a private in-memory database.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named stores (creation order is rowid order)
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (store, request identity)
CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_store ON entries(store);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, store: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO stores (name, created_at) VALUES (?, datetime('now'))",
        params![store],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;

    Ok(())
  }

  fn has(&self, store: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row("SELECT 1 FROM stores WHERE name = ?", params![store], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up store {}: {}", store, e))?;

    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, store: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE store = ?", params![store])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", store, e))?;

    let removed = tx
      .execute("DELETE FROM stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete store {}: {}", store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO stores (name, created_at) VALUES (?, datetime('now'))",
      params![store],
    )
    .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries
         (store, entry_key, method, url, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        store,
        request.cache_key(),
        request.method(),
        request.normalized_url(),
        response.status,
        response.status_text,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store response: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, store: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, cached_at FROM entries
         WHERE store = ? AND entry_key = ?",
        params![store, request.cache_key()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query store {}: {}", store, e))?;

    match row {
      Some((status, status_text, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            status_text,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn summaries(&self) -> Result<Vec<StoreSummary>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT s.name, s.created_at, COUNT(e.entry_key) FROM stores s
         LEFT JOIN entries e ON e.store = s.name
         GROUP BY s.name
         ORDER BY MIN(s.rowid)",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to summarize stores: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read store summary: {}", e))?;

    rows
      .into_iter()
      .map(|(name, created_at, entries)| {
        Ok(StoreSummary {
          name,
          entries: entries as usize,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
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

  fn req(url: &str) -> Request {
    Request::parse("GET", url).unwrap()
  }

  fn exercise_backend(storage: &dyn CacheStorage) {
    assert!(storage.keys().unwrap().is_empty());

    storage.open("v1-static").unwrap();
    storage.open("v1-static").unwrap();
    assert!(storage.has("v1-static").unwrap());
    assert!(!storage.has("v1-data").unwrap());

    let first = Response::ok("first").with_header("Content-Type", "text/html");
    storage
      .put("v1-data", &req("https://app.test/routes.json"), &first)
      .unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["v1-static", "v1-data"]);

    let hit = storage
      .get("v1-data", &req("https://app.test/routes.json"))
      .unwrap()
      .unwrap();
    assert_eq!(hit.response, first);

    // Overwrite keeps a single entry
    storage
      .put("v1-data", &req("https://app.test/routes.json"), &Response::ok("second"))
      .unwrap();
    let hit = storage
      .get("v1-data", &req("https://app.test/routes.json"))
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body_text(), "second");

    // Stores are isolated
    assert!(storage
      .get("v1-static", &req("https://app.test/routes.json"))
      .unwrap()
      .is_none());

    let summaries = storage.summaries().unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].entries, 0);
    assert_eq!(summaries[1].entries, 1);

    assert!(storage.delete("v1-data").unwrap());
    assert!(!storage.delete("v1-data").unwrap());
    assert!(storage
      .get("v1-data", &req("https://app.test/routes.json"))
      .unwrap()
      .is_none());
    assert_eq!(storage.keys().unwrap(), vec!["v1-static"]);
  }

  #[test]
  fn test_memory_storage() {
    exercise_backend(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    exercise_backend(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_match_in_checks_only_listed_stores_in_order() {
    let storage = MemoryStorage::new();
    let request = req("https://app.test/roles.json");
    storage.open("v1-data").unwrap();
    storage
      .put("v1-static", &request, &Response::ok("from shell"))
      .unwrap();
    storage
      .put("v0-static", &request, &Response::ok("from v0"))
      .unwrap();

    let hit = storage
      .match_in(&["v1-data", "v1-static"], &request)
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body_text(), "from shell");

    storage
      .put("v1-data", &request, &Response::ok("from data"))
      .unwrap();
    let hit = storage
      .match_in(&["v1-data", "v1-static"], &request)
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body_text(), "from data");

    // Stores outside the list are never consulted
    storage.delete("v1-static").unwrap();
    storage.delete("v1-data").unwrap();
    assert!(storage
      .match_in(&["v1-data", "v1-static"], &request)
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_sqlite_roundtrips_headers_and_binary_body() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = req("https://unpkg.com/leaflet@1.9.4/dist/images/marker.png");
    let response = Response::new(200, "OK", vec![0u8, 159, 146, 150])
      .with_header("Content-Type", "image/png")
      .with_header("Cache-Control", "max-age=31536000");

    storage.put("v1-static", &request, &response).unwrap();
    let hit = storage.get("v1-static", &request).unwrap().unwrap();
    assert_eq!(hit.response, response);
  }
}
