use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fixture_kernel_core::{
    fingerprint, KernelError, PositionOrder, PositionOrderStore, ProductionId, Rfc3339Codec,
    TimestampCodec,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS position_orders (
  production_id TEXT PRIMARY KEY,
  positions_json TEXT NOT NULL,
  fingerprint TEXT NOT NULL CHECK (length(fingerprint) = 16),
  last_updated TEXT NOT NULL
);
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

/// One problem found in one stored row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidOrder {
    /// Raw column value, since a broken row may not hold a valid id.
    pub production_id: String,
    pub problem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub checked_orders: usize,
    pub invalid_orders: Vec<InvalidOrder>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.invalid_orders.is_empty()
            && self.schema_status.pending_versions.is_empty()
    }
}

impl SqliteStore {
    /// Open the position order database. Writers from other processes are
    /// waited on for up to five seconds.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open position order database {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .context("failed to configure position order database")?;

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

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
        }

        Ok(())
    }

    /// Stored order for `production_id`, if any.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or holds malformed data.
    pub fn load_order(&self, production_id: ProductionId) -> Result<Option<PositionOrder>> {
        let row = self
            .conn
            .query_row(
                "SELECT positions_json, fingerprint, last_updated
                 FROM position_orders WHERE production_id = ?1",
                params![production_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load position order for {production_id}"))?;

        let Some((positions_json, fingerprint, last_updated)) = row else {
            return Ok(None);
        };

        let positions = serde_json::from_str::<Vec<String>>(&positions_json)
            .with_context(|| format!("invalid positions_json for {production_id}"))?;
        let last_updated = decode_timestamp(&last_updated)?;

        Ok(Some(PositionOrder { production_id, positions, last_updated, fingerprint }))
    }

    /// Insert or replace the order for `order.production_id`.
    ///
    /// # Errors
    /// Returns an error when the order cannot be encoded or written.
    pub fn save_order(&mut self, order: &PositionOrder) -> Result<()> {
        let positions_json =
            serde_json::to_string(&order.positions).context("failed to encode positions_json")?;
        let last_updated = encode_timestamp(order.last_updated)?;

        self.conn
            .execute(
                "INSERT INTO position_orders(production_id, positions_json, fingerprint, last_updated)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(production_id) DO UPDATE SET
                   positions_json = excluded.positions_json,
                   fingerprint = excluded.fingerprint,
                   last_updated = excluded.last_updated",
                params![order.production_id.to_string(), positions_json, order.fingerprint, last_updated],
            )
            .with_context(|| format!("failed to save position order for {}", order.production_id))?;

        Ok(())
    }

    /// Every stored order, ordered by production id.
    ///
    /// # Errors
    /// Returns an error when any row cannot be read or decoded.
    pub fn list_orders(&self) -> Result<Vec<PositionOrder>> {
        let mut stmt = self
            .conn
            .prepare("SELECT production_id FROM position_orders ORDER BY production_id ASC")
            .context("failed to prepare position order listing")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list position orders")?;

        let mut orders = Vec::with_capacity(ids.len());
        for raw in ids {
            let production_id = ProductionId::parse(&raw)
                .map_err(|err| anyhow!(err))
                .with_context(|| format!("invalid production_id in position_orders: {raw}"))?;
            if let Some(order) = self.load_order(production_id)? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    /// Remove every stored order.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_orders(&mut self) -> Result<()> {
        self.conn
            .execute("DELETE FROM position_orders", [])
            .context("failed to clear position orders")?;
        Ok(())
    }

    /// Run `PRAGMA quick_check`, then validate every stored position order.
    ///
    /// A row is flagged when its production id or timestamp does not decode,
    /// `positions_json` is not a list of names, the list holds duplicates, or the
    /// stored fingerprint no longer matches the stored positions.
    ///
    /// # Errors
    /// Returns an error when a check query fails; malformed rows are reported, not raised.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT production_id, positions_json, fingerprint, last_updated
                 FROM position_orders ORDER BY production_id ASC",
            )
            .context("failed to prepare position order scan")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredOrderRow {
                    production_id: row.get(0)?,
                    positions_json: row.get(1)?,
                    fingerprint: row.get(2)?,
                    last_updated: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to scan position orders")?;

        let checked_orders = rows.len();
        let invalid_orders = rows
            .iter()
            .flat_map(|row| {
                row.problems().into_iter().map(|problem| InvalidOrder {
                    production_id: row.production_id.clone(),
                    problem,
                })
            })
            .collect::<Vec<_>>();

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            checked_orders,
            invalid_orders,
            schema_status,
        })
    }
}

struct StoredOrderRow {
    production_id: String,
    positions_json: String,
    fingerprint: String,
    last_updated: String,
}

impl StoredOrderRow {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if ProductionId::parse(&self.production_id).is_err() {
            problems.push("production_id is not a ULID".to_string());
        }
        if Rfc3339Codec.decode(&self.last_updated).is_err() {
            problems.push(format!("last_updated is not RFC3339: {}", self.last_updated));
        }
        match serde_json::from_str::<Vec<String>>(&self.positions_json) {
            Err(err) => problems.push(format!("positions_json does not decode: {err}")),
            Ok(positions) => {
                let unique = positions.iter().collect::<BTreeSet<_>>();
                if unique.len() != positions.len() {
                    problems.push("positions_json contains duplicate positions".to_string());
                }
                if fingerprint(&positions) != self.fingerprint {
                    problems.push("fingerprint does not match stored positions".to_string());
                }
            }
        }
        problems
    }
}

impl PositionOrderStore for SqliteStore {
    fn load(&self, production_id: ProductionId) -> Result<Option<PositionOrder>, KernelError> {
        self.load_order(production_id).map_err(persistence)
    }

    fn save(&mut self, order: &PositionOrder) -> Result<(), KernelError> {
        self.save_order(order).map_err(persistence)
    }

    fn clear(&mut self) -> Result<(), KernelError> {
        self.clear_orders().map_err(persistence)
    }
}

fn persistence(err: anyhow::Error) -> KernelError {
    KernelError::Persistence(format!("{err:#}"))
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
    let now = encode_timestamp(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn encode_timestamp(value: OffsetDateTime) -> Result<String> {
    Rfc3339Codec.encode(value).map_err(|err| anyhow!(err))
}

fn decode_timestamp(raw: &str) -> Result<OffsetDateTime> {
    Rfc3339Codec.decode(raw).map_err(|err| anyhow!(err))
}
