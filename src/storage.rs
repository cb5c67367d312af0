//! SQLite-backed snapshot history.
//!
//! Every write is an upsert keyed by the current second followed by a
//! retention sweep, both inside one IMMEDIATE transaction. The store is a
//! best-effort side channel for the poll loop: public writes report `bool`
//! and queries report "no data" instead of failing, while the `try_*`
//! variants keep the typed [`StoreError`].
//!
//! Reads run in a DEFERRED transaction and never take the write lock, so
//! under WAL they proceed while another process is writing.

use crate::config::DEFAULT_RETENTION;
use crate::error::StoreError;
use crate::models::{CostObservation, UsageObservation, Workspace};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a connection waits on another process's lock before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS usage_snapshots (
        timestamp INTEGER PRIMARY KEY,
        credits_used INTEGER,
        utilization_percent REAL,
        resets_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_timestamp
        ON usage_snapshots(timestamp DESC);

    CREATE TABLE IF NOT EXISTS console_usage_snapshots (
        timestamp INTEGER PRIMARY KEY,
        mtd_cost REAL,
        workspace_costs_json TEXT
    );
"#;

/// A cumulative quantity tracked in one snapshot table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    Credits,
    Utilization,
    MtdCost,
}

impl Measure {
    fn table(self) -> &'static str {
        match self {
            Measure::Credits | Measure::Utilization => "usage_snapshots",
            Measure::MtdCost => "console_usage_snapshots",
        }
    }

    fn column(self) -> &'static str {
        match self {
            Measure::Credits => "credits_used",
            Measure::Utilization => "utilization_percent",
            Measure::MtdCost => "mtd_cost",
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Measure::Credits => "credits",
            Measure::Utilization => "utilization",
            Measure::MtdCost => "mtd_cost",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    db_path: Option<PathBuf>,
    retention: Duration,
}

impl SnapshotStore {
    /// Creates the parent directory and both tables. Fails if the file
    /// cannot be opened or is not a database.
    pub fn open(path: &Path, retention: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let this = Self {
            db_path: Some(path.to_path_buf()),
            retention,
        };
        this.with_connection(|tx| {
            tx.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        Ok(this)
    }

    /// Like [`SnapshotStore::open`], but degrades to a no-op store instead of
    /// failing.
    pub fn open_or_disabled(path: &Path, retention: Duration) -> Self {
        match Self::open(path, retention) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "snapshot storage unavailable, history and projections disabled"
                );
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            db_path: None,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.db_path.is_some()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        let path = self.db_path.as_ref().ok_or(StoreError::Unavailable)?;
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = self.open_connection()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::debug!(journal_mode = %mode, "database did not switch to WAL");
        }
        Ok(conn)
    }

    /// Runs `f` inside an IMMEDIATE transaction on a fresh connection.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back when it
    /// returns `Err` or unwinds; the connection is closed on every path.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs `f` inside a DEFERRED transaction that only ever reads, giving
    /// it one consistent snapshot of the file. The journal mode is already
    /// persisted by [`SnapshotStore::open`], so no pragma is issued here.
    pub fn with_read_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn cutoff(&self, now: i64) -> i64 {
        now - self.retention.as_secs() as i64
    }

    pub fn try_store_usage_snapshot_at(
        &self,
        observation: &UsageObservation,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if observation.credits_used.is_none() && observation.utilization_percent.is_none() {
            return Err(StoreError::MissingMeasure("credits_used or utilization_percent"));
        }

        let timestamp = now.timestamp();
        let cutoff = self.cutoff(timestamp);
        self.with_connection(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO usage_snapshots
                 (timestamp, credits_used, utilization_percent, resets_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    timestamp,
                    observation.credits_used,
                    observation.utilization_percent,
                    observation.resets_at,
                ],
            )?;
            let purged = tx.execute(
                "DELETE FROM usage_snapshots WHERE timestamp < ?1",
                [cutoff],
            )?;
            if purged > 0 {
                tracing::debug!(purged, "pruned expired usage snapshots");
            }
            Ok(())
        })
    }

    pub fn store_usage_snapshot_at(
        &self,
        observation: &UsageObservation,
        now: DateTime<Utc>,
    ) -> bool {
        report_write("usage", self.try_store_usage_snapshot_at(observation, now))
    }

    pub fn store_usage_snapshot(&self, observation: &UsageObservation) -> bool {
        self.store_usage_snapshot_at(observation, Utc::now())
    }

    pub fn try_store_console_snapshot_at(
        &self,
        observation: &CostObservation,
        workspaces: Option<&[Workspace]>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mtd_cost = observation
            .mtd_cost
            .ok_or(StoreError::MissingMeasure("mtd_cost"))?;
        let workspace_json = serde_json::to_string(&workspaces)?;

        let timestamp = now.timestamp();
        let cutoff = self.cutoff(timestamp);
        self.with_connection(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO console_usage_snapshots
                 (timestamp, mtd_cost, workspace_costs_json)
                 VALUES (?1, ?2, ?3)",
                params![timestamp, mtd_cost, workspace_json],
            )?;
            let purged = tx.execute(
                "DELETE FROM console_usage_snapshots WHERE timestamp < ?1",
                [cutoff],
            )?;
            if purged > 0 {
                tracing::debug!(purged, "pruned expired console snapshots");
            }
            Ok(())
        })
    }

    pub fn store_console_snapshot_at(
        &self,
        observation: &CostObservation,
        workspaces: Option<&[Workspace]>,
        now: DateTime<Utc>,
    ) -> bool {
        report_write(
            "console",
            self.try_store_console_snapshot_at(observation, workspaces, now),
        )
    }

    pub fn store_console_snapshot(
        &self,
        observation: &CostObservation,
        workspaces: Option<&[Workspace]>,
    ) -> bool {
        self.store_console_snapshot_at(observation, workspaces, Utc::now())
    }

    /// Oldest `(timestamp, value)` at or after `cutoff` with a non-null value.
    pub fn earliest_since(
        &self,
        measure: Measure,
        cutoff: i64,
    ) -> Result<Option<(i64, f64)>, StoreError> {
        self.with_read_connection(|conn| earliest_in(conn, measure, cutoff))
    }

    pub fn count(&self, measure: Measure) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", measure.table());
        self.with_read_connection(|conn| Ok(conn.query_row(&sql, [], |r| r.get(0))?))
    }
}

/// [`SnapshotStore::earliest_since`] on a connection the caller already
/// holds, for running several lookups against one snapshot.
pub fn earliest_in(
    conn: &Connection,
    measure: Measure,
    cutoff: i64,
) -> Result<Option<(i64, f64)>, StoreError> {
    let sql = format!(
        "SELECT timestamp, CAST({column} AS REAL) FROM {table}
         WHERE timestamp >= ?1 AND {column} IS NOT NULL
         ORDER BY timestamp ASC
         LIMIT 1",
        column = measure.column(),
        table = measure.table(),
    );
    let row = conn
        .query_row(&sql, [cutoff], |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()?;
    Ok(row)
}

fn report_write(kind: &'static str, result: Result<(), StoreError>) -> bool {
    match result {
        Ok(()) => true,
        Err(StoreError::Unavailable) => {
            tracing::debug!(kind, "snapshot skipped, storage disabled");
            false
        }
        Err(err) => {
            tracing::warn!(kind, error = %err, "failed to store snapshot");
            false
        }
    }
}
