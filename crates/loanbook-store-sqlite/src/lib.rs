use std::path::Path;

use anyhow::{anyhow, Context, Result};
use loanbook_core::{ClientId, ClientRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS clients (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  loan REAL NOT NULL,
  repaid REAL NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);
";

const MIGRATION_002_INDEXES_SQL: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_clients_name_created ON clients(name, created_at);
CREATE INDEX IF NOT EXISTS idx_clients_name ON clients(name);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Field set for one row insert; the store assigns the surrogate id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewClient {
    pub name: String,
    pub loan: f64,
    pub repaid: f64,
    pub created_at: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed client store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        // Databases created before contact fields existed gain the columns here;
        // ALTER TABLE has no IF NOT EXISTS, so probe first.
        if !table_has_column(&tx, "clients", "email")? {
            tx.execute_batch("ALTER TABLE clients ADD COLUMN email TEXT")
                .context("failed to add clients.email column")?;
        }
        if !table_has_column(&tx, "clients", "phone")? {
            tx.execute_batch("ALTER TABLE clients ADD COLUMN phone TEXT")
                .context("failed to add clients.phone column")?;
        }

        tx.execute_batch(MIGRATION_002_INDEXES_SQL).context("failed to create v2 indexes")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Insert one client row and return the assigned surrogate id.
    ///
    /// The UNIQUE(name, created_at) index makes natural-key duplicates fail
    /// here; callers decide whether that aborts or is counted.
    ///
    /// # Errors
    /// Returns an error when the insert fails, including uniqueness violations.
    pub fn insert_client(&mut self, client: &NewClient) -> Result<ClientId> {
        self.conn
            .execute(
                "INSERT INTO clients(name, loan, repaid, created_at, email, phone)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    client.name,
                    client.loan,
                    client.repaid,
                    client.created_at,
                    client.email,
                    client.phone,
                ],
            )
            .context("failed to insert client record")?;

        Ok(ClientId(self.conn.last_insert_rowid()))
    }

    /// Overwrite `name`, `loan`, `email`, `phone` for the row with this id.
    ///
    /// `repaid` and `created_at` are deliberately untouched.
    ///
    /// # Errors
    /// Returns an error when the update statement fails.
    pub fn update_client_fields(
        &mut self,
        id: ClientId,
        name: &str,
        loan: f64,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE clients SET name = ?1, loan = ?2, email = ?3, phone = ?4 WHERE id = ?5",
                params![name, loan, email, phone, id.0],
            )
            .context("failed to update client record")
    }

    /// Apply a signed repayment delta to one row: `repaid := repaid + delta`.
    ///
    /// # Errors
    /// Returns an error when the update statement fails.
    pub fn add_repayment(&mut self, id: ClientId, delta: f64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE clients SET repaid = repaid + ?1 WHERE id = ?2",
                params![delta, id.0],
            )
            .context("failed to update repayment")
    }

    /// Delete one row by id, returning the affected-row count.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_client(&mut self, id: ClientId) -> Result<usize> {
        self.conn
            .execute("DELETE FROM clients WHERE id = ?1", params![id.0])
            .context("failed to delete client record")
    }

    /// Fetch one row by surrogate id.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_client(&self, id: ClientId) -> Result<Option<ClientRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, loan, repaid, created_at, email, phone
             FROM clients WHERE id = ?1",
        )?;
        let record = stmt.query_row(params![id.0], map_client_row).optional()?;
        Ok(record)
    }

    /// Find the earliest-created row matching this name, if any.
    ///
    /// Several rows can share a name with distinct `created_at` values after a
    /// restore; the lowest id wins so the upsert engine targets exactly one row.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_by_name(&self, name: &str) -> Result<Option<ClientRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, loan, repaid, created_at, email, phone
             FROM clients WHERE name = ?1 ORDER BY id ASC LIMIT 1",
        )?;
        let record = stmt.query_row(params![name], map_client_row).optional()?;
        Ok(record)
    }

    /// Find a row by exact natural-key match on `(name, created_at)`.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_by_natural_key(
        &self,
        name: &str,
        created_at: &str,
    ) -> Result<Option<ClientRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, loan, repaid, created_at, email, phone
             FROM clients WHERE name = ?1 AND created_at = ?2",
        )?;
        let record = stmt.query_row(params![name, created_at], map_client_row).optional()?;
        Ok(record)
    }

    /// Load every client row in store iteration order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, loan, repaid, created_at, email, phone FROM clients",
        )?;
        let rows = stmt.query_map([], map_client_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("failed to read client row")?);
        }
        Ok(records)
    }

    /// Count persisted client rows.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_clients(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM clients", [], |row| row.get::<_, i64>(0))
            .context("failed to count client records")
    }
}

fn map_client_row(row: &Row<'_>) -> rusqlite::Result<ClientRecord> {
    Ok(ClientRecord {
        id: ClientId(row.get(0)?),
        name: row.get(1)?,
        loan: row.get(2)?,
        repaid: row.get(3)?,
        created_at: row.get(4)?,
        email: row.get(5)?,
        phone: row.get(6)?,
    })
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = loanbook_core::now_rfc3339().map_err(|err| anyhow!(err))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
