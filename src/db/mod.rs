//! Local cache store for Craftbook Sync
//!
//! SQLite-backed durable storage for the catalog snapshot, the local mirror of
//! the user's reports, and small engine settings.
//! Every write runs inside a transaction, so a failed write leaves the previous
//! snapshot readable.

use crate::models::{CatalogSnapshot, Command, Recipe, Report, ReportKind, ReportStatus};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

const SCHEMA_VERSION: i64 = 1;

const RECIPES_BLOB: &str = "recipes";
const COMMANDS_BLOB: &str = "commands";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS catalog_cache (
        name TEXT PRIMARY KEY,
        payload BLOB NOT NULL,
        item_count INTEGER NOT NULL,
        fetched_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS report_mirror (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        category TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_report_mirror_created
        ON report_mirror(created_at);
"#;

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Per-step outcome of [`LocalCacheStore::clear_all`]
#[derive(Debug)]
pub struct CacheClearSummary {
    /// Catalog rows removed
    pub catalog: CacheResult<usize>,
    /// Mirrored reports removed
    pub report_mirror: CacheResult<usize>,
}

impl CacheClearSummary {
    pub fn is_complete(&self) -> bool {
        self.catalog.is_ok() && self.report_mirror.is_ok()
    }
}

/// Thread-safe SQLite cache store
#[derive(Clone)]
pub struct LocalCacheStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl LocalCacheStore {
    /// Open (or create) the cache file at `db_path`
    pub fn new(db_path: PathBuf) -> CacheResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        log::info!("Local cache opened at {:?}", db_path);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory store (for testing)
    ///
    /// The pool holds a single connection: every SQLite memory connection is
    /// its own database.
    pub fn in_memory() -> CacheResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    fn get_conn(&self) -> CacheResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn initialize_schema(conn: &Connection) -> CacheResult<()> {
        conn.execute_batch(SCHEMA)?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if version.is_none() {
            log::info!("Initializing cache schema version {}", SCHEMA_VERSION);
            conn.execute(
                "INSERT INTO settings (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }

        Ok(())
    }

    /// Run a store operation on the blocking thread pool
    pub async fn blocking<T, F>(&self, f: F) -> CacheResult<T>
    where
        F: FnOnce(&LocalCacheStore) -> CacheResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?
    }

    // =========================================================================
    // CATALOG
    // =========================================================================

    /// Load the cached catalog snapshot, if one was saved
    pub fn load(&self) -> CacheResult<Option<CatalogSnapshot>> {
        let conn = self.get_conn()?;

        let recipes_row = Self::read_blob(&conn, RECIPES_BLOB)?;
        let Some((recipes_payload, fetched_at)) = recipes_row else {
            return Ok(None);
        };

        let recipes: Vec<Recipe> = decode_blob(&recipes_payload)?;
        let commands: Vec<Command> = match Self::read_blob(&conn, COMMANDS_BLOB)? {
            Some((payload, _)) => decode_blob(&payload)?,
            None => Vec::new(),
        };

        log::debug!(
            "Loaded cached catalog: {} recipes, {} commands",
            recipes.len(),
            commands.len()
        );

        Ok(Some(CatalogSnapshot {
            recipes,
            commands,
            fetched_at: parse_timestamp(&fetched_at)?,
        }))
    }

    /// Replace the cached catalog snapshot atomically
    pub fn save(&self, snapshot: &CatalogSnapshot) -> CacheResult<()> {
        let recipes = encode_blob(&snapshot.recipes)?;
        let commands = encode_blob(&snapshot.commands)?;
        let fetched_at = snapshot.fetched_at.to_rfc3339();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        for (name, payload, count) in [
            (RECIPES_BLOB, &recipes, snapshot.recipes.len()),
            (COMMANDS_BLOB, &commands, snapshot.commands.len()),
        ] {
            tx.execute(
                r#"
                INSERT INTO catalog_cache (name, payload, item_count, fetched_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(name) DO UPDATE SET
                    payload = excluded.payload,
                    item_count = excluded.item_count,
                    fetched_at = excluded.fetched_at,
                    updated_at = excluded.updated_at
                "#,
                params![name, payload, count as i64, fetched_at, now],
            )?;
        }

        tx.commit()?;

        log::info!(
            "Catalog cached: {} recipes, {} commands ({} bytes compressed)",
            snapshot.recipes.len(),
            snapshot.commands.len(),
            recipes.len() + commands.len()
        );
        Ok(())
    }

    /// Remove the cached catalog. Returns the number of rows removed.
    pub fn clear_catalog_cache(&self) -> CacheResult<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM catalog_cache", [])?;
        tx.commit()?;

        log::info!("Catalog cache cleared ({} entries)", removed);
        Ok(removed)
    }

    fn read_blob(conn: &Connection, name: &str) -> CacheResult<Option<(Vec<u8>, String)>> {
        conn.query_row(
            "SELECT payload, fetched_at FROM catalog_cache WHERE name = ?1",
            [name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(CacheError::from)
    }

    // =========================================================================
    // REPORT MIRROR
    // =========================================================================

    /// Mirrored reports, newest first
    pub fn load_reports(&self) -> CacheResult<Vec<Report>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, kind, name, category, description, status, created_at
            FROM report_mirror
            ORDER BY created_at DESC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut reports = Vec::new();
        for row in rows {
            let (id, kind, name, category, description, status, created_at) = row?;
            reports.push(Report {
                id,
                kind: ReportKind::from_str(&kind).map_err(CacheError::Corrupt)?,
                name,
                category,
                description,
                status: ReportStatus::from_str(&status).map_err(CacheError::Corrupt)?,
                created_at: parse_timestamp(&created_at)?,
            });
        }

        Ok(reports)
    }

    /// Replace the whole mirror with `reports`
    pub fn save_reports(&self, reports: &[Report]) -> CacheResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM report_mirror", [])?;
        for report in reports {
            Self::write_report(&tx, report)?;
        }

        tx.commit()?;
        log::debug!("Report mirror replaced ({} reports)", reports.len());
        Ok(())
    }

    /// Insert or update one mirrored report
    pub fn upsert_report(&self, report: &Report) -> CacheResult<()> {
        let conn = self.get_conn()?;
        Self::write_report(&conn, report)
    }

    /// Remove one mirrored report. Returns whether a row existed.
    pub fn remove_report(&self, id: &str) -> CacheResult<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute("DELETE FROM report_mirror WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    /// Remove every mirrored report
    pub fn clear_report_mirror(&self) -> CacheResult<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM report_mirror", [])?;
        tx.commit()?;

        log::info!("Report mirror cleared ({} reports)", removed);
        Ok(removed)
    }

    fn write_report(conn: &Connection, report: &Report) -> CacheResult<()> {
        conn.execute(
            r#"
            INSERT INTO report_mirror (id, kind, name, category, description, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![
                report.id,
                report.kind.as_str(),
                report.name,
                report.category,
                report.description,
                report.status.as_str(),
                report.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // CLEAR ALL
    // =========================================================================

    /// Clear the catalog cache and the report mirror.
    ///
    /// Each step runs on its own; a failure in one does not stop the other.
    /// Settings survive.
    pub fn clear_all(&self) -> CacheClearSummary {
        let catalog = self.clear_catalog_cache();
        if let Err(e) = &catalog {
            log::error!("Failed to clear catalog cache: {}", e);
        }

        let report_mirror = self.clear_report_mirror();
        if let Err(e) = &report_mirror {
            log::error!("Failed to clear report mirror: {}", e);
        }

        CacheClearSummary {
            catalog,
            report_mirror,
        }
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        match result {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> CacheResult<()> {
        let conn = self.get_conn()?;
        let json =
            serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }
}

/// JSON-encode and gzip a catalog section
fn encode_blob<T: Serialize>(value: &T) -> CacheResult<Vec<u8>> {
    let json = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn decode_blob<T: serde::de::DeserializeOwned>(payload: &[u8]) -> CacheResult<T> {
    let mut decoder = GzDecoder::new(payload);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| CacheError::Corrupt(format!("gzip: {}", e)))?;

    serde_json::from_slice(&json).map_err(|e| CacheError::Corrupt(e.to_string()))
}

fn parse_timestamp(value: &str) -> CacheResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::Corrupt(format!("timestamp {}: {}", value, e)))
}

// ============================================================================
// Tests
// ============================================================================
