//! SQLite database for durable site state
//!
//! One row per tenant site plus an append-only event log. Runtime fields
//! (port and url) are only trusted while a process is live; reconciliation
//! corrects them after a crash or restart.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const SITE_COLUMNS: &str = "tenant_id, output_dir, domain, status, last_error, port, url,
     last_built_at, last_started_at, last_stopped_at, created_at, updated_at";

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: site records
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: sites");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                tenant_id TEXT PRIMARY KEY,
                output_dir TEXT NOT NULL,
                domain TEXT,
                status TEXT NOT NULL DEFAULT 'building',
                last_error TEXT,
                port INTEGER,
                url TEXT,
                last_built_at TEXT,
                last_started_at TEXT,
                last_stopped_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_sites_port ON sites(port);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: site event log
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: site events");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS site_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_site_events_tenant ON site_events(tenant_id, id);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== Site Operations ====================

    /// Create the record if missing and mark it as building
    pub fn upsert_site_building(&self, tenant_id: &str, output_dir: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sites (tenant_id, output_dir, status)
             VALUES (?1, ?2, 'building')
             ON CONFLICT(tenant_id) DO UPDATE SET
                output_dir = excluded.output_dir,
                status = 'building',
                last_error = NULL,
                updated_at = datetime('now')",
            params![tenant_id, output_dir],
        )
        .context("Failed to mark site building")?;
        Ok(())
    }

    /// Mark a build as finished
    pub fn mark_site_ready(&self, tenant_id: &str, domain: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sites SET status = 'ready', last_error = NULL, domain = ?1,
                last_built_at = datetime('now'), updated_at = datetime('now')
             WHERE tenant_id = ?2",
            params![domain, tenant_id],
        )?;
        Ok(())
    }

    /// Mark a build as failed with the captured message
    pub fn mark_site_error(&self, tenant_id: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sites SET status = 'error', last_error = ?1, updated_at = datetime('now')
             WHERE tenant_id = ?2",
            params![message, tenant_id],
        )?;
        Ok(())
    }

    /// Record (or clear) the last error without changing the status
    pub fn set_site_last_error(&self, tenant_id: &str, message: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sites SET last_error = ?1, updated_at = datetime('now') WHERE tenant_id = ?2",
            params![message, tenant_id],
        )?;
        Ok(())
    }

    /// Get a site by tenant id
    pub fn get_site(&self, tenant_id: &str) -> Result<Option<SiteRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sites WHERE tenant_id = ?1", SITE_COLUMNS),
            params![tenant_id],
            site_from_row,
        )
        .optional()
        .context("Failed to get site")
    }

    /// List all sites
    pub fn list_sites(&self) -> Result<Vec<SiteRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sites ORDER BY tenant_id",
            SITE_COLUMNS
        ))?;

        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    /// List sites whose record claims a live port
    pub fn list_live_sites(&self) -> Result<Vec<SiteRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sites WHERE port IS NOT NULL ORDER BY tenant_id",
            SITE_COLUMNS
        ))?;

        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    /// Persist the runtime fields of a freshly started site
    pub fn set_site_running(&self, tenant_id: &str, port: u16, url: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sites SET port = ?1, url = ?2, last_error = NULL,
                last_started_at = datetime('now'), updated_at = datetime('now')
             WHERE tenant_id = ?3",
            params![port, url, tenant_id],
        )?;
        Ok(())
    }

    /// Restore runtime fields without touching timestamps
    pub fn restore_site_runtime(&self, tenant_id: &str, port: u16, url: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sites SET port = ?1, url = ?2, updated_at = datetime('now') WHERE tenant_id = ?3",
            params![port, url, tenant_id],
        )?;
        Ok(())
    }

    /// Replace the url of a live site (e.g. with its public address)
    pub fn set_site_url(&self, tenant_id: &str, url: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sites SET url = ?1, updated_at = datetime('now')
             WHERE tenant_id = ?2 AND port IS NOT NULL",
            params![url, tenant_id],
        )?;
        Ok(())
    }

    /// Clear port and url. Returns true if the record carried either
    pub fn clear_site_runtime(&self, tenant_id: &str, stopped: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let had_runtime: bool = conn
            .query_row(
                "SELECT port IS NOT NULL OR url IS NOT NULL FROM sites WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(false);

        if stopped {
            conn.execute(
                "UPDATE sites SET port = NULL, url = NULL,
                    last_stopped_at = datetime('now'), updated_at = datetime('now')
                 WHERE tenant_id = ?1",
                params![tenant_id],
            )?;
        } else if had_runtime {
            conn.execute(
                "UPDATE sites SET port = NULL, url = NULL, updated_at = datetime('now')
                 WHERE tenant_id = ?1",
                params![tenant_id],
            )?;
        }

        Ok(had_runtime)
    }

    // ==================== Event Operations ====================

    /// Append an event to a site's log
    pub fn log_event(&self, tenant_id: &str, kind: SiteEventKind, detail: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO site_events (tenant_id, kind, detail) VALUES (?1, ?2, ?3)",
            params![tenant_id, kind.as_str(), detail],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent events for a site, newest first
    pub fn get_site_events(&self, tenant_id: &str, limit: usize) -> Result<Vec<SiteEventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, kind, detail, created_at
             FROM site_events WHERE tenant_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;

        let events = stmt
            .query_map(params![tenant_id, limit as i64], |row| {
                Ok(SiteEventRecord {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    kind: row.get(2)?,
                    detail: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

fn site_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SiteRecord> {
    Ok(SiteRecord {
        tenant_id: row.get(0)?,
        output_dir: row.get(1)?,
        domain: row.get(2)?,
        status: row.get(3)?,
        last_error: row.get(4)?,
        port: row.get(5)?,
        url: row.get(6)?,
        last_built_at: row.get(7)?,
        last_started_at: row.get(8)?,
        last_stopped_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

// ==================== Record Types ====================

/// Build status of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Building,
    Ready,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Building => "building",
            BuildStatus::Ready => "ready",
            BuildStatus::Error => "error",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "building" => Ok(BuildStatus::Building),
            "ready" => Ok(BuildStatus::Ready),
            "error" => Ok(BuildStatus::Error),
            other => anyhow::bail!("unknown build status '{}'", other),
        }
    }
}

impl ToSql for BuildStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for BuildStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

/// Kind of a site event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteEventKind {
    Materialize,
    Built,
    BuildFailed,
    Started,
    StartFailed,
    Stopped,
    Exited,
    Corrected,
    Interrupted,
}

impl SiteEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteEventKind::Materialize => "materialize",
            SiteEventKind::Built => "built",
            SiteEventKind::BuildFailed => "build_failed",
            SiteEventKind::Started => "started",
            SiteEventKind::StartFailed => "start_failed",
            SiteEventKind::Stopped => "stopped",
            SiteEventKind::Exited => "exited",
            SiteEventKind::Corrected => "corrected",
            SiteEventKind::Interrupted => "interrupted",
        }
    }
}

/// Site record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    pub tenant_id: String,
    pub output_dir: String,
    pub domain: Option<String>,
    pub status: BuildStatus,
    pub last_error: Option<String>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub last_built_at: Option<String>,
    pub last_started_at: Option<String>,
    pub last_stopped_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Site event record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteEventRecord {
    pub id: i64,
    pub tenant_id: String,
    pub kind: String,
    pub detail: Option<String>,
    pub created_at: String,
}
