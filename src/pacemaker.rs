//! Read-only view of the pace-maker companion tool's state.
//!
//! Everything here is best effort: a missing directory, config or database
//! simply means there is nothing to show.

use crate::analytics::parse_timestamp_in;
use chrono::{DateTime, Local, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BLOCKAGE_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Default, Deserialize)]
struct PaceMakerConfig {
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaceMakerUsage {
    pub timestamp: DateTime<Utc>,
    pub five_hour_util: Option<f64>,
    pub five_hour_resets_at: Option<DateTime<Utc>>,
    pub seven_day_util: Option<f64>,
    pub seven_day_resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaceMakerStatus {
    pub enabled: bool,
    pub latest: Option<PaceMakerUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockageCategory {
    IntentValidation,
    IntentValidationTdd,
    PacingTempo,
    PacingQuota,
    Other,
}

impl BlockageCategory {
    pub const ALL: [BlockageCategory; 5] = [
        BlockageCategory::IntentValidation,
        BlockageCategory::IntentValidationTdd,
        BlockageCategory::PacingTempo,
        BlockageCategory::PacingQuota,
        BlockageCategory::Other,
    ];

    pub fn from_key(raw: &str) -> Self {
        match raw {
            "intent_validation" => BlockageCategory::IntentValidation,
            "intent_validation_tdd" => BlockageCategory::IntentValidationTdd,
            "pacing_tempo" => BlockageCategory::PacingTempo,
            "pacing_quota" => BlockageCategory::PacingQuota,
            _ => BlockageCategory::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BlockageCategory::IntentValidation => "Intent Validation",
            BlockageCategory::IntentValidationTdd => "Intent TDD",
            BlockageCategory::PacingTempo => "Pacing Tempo",
            BlockageCategory::PacingQuota => "Pacing Quota",
            BlockageCategory::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockageStats {
    counts: BTreeMap<BlockageCategory, u64>,
}

impl BlockageStats {
    pub fn count(&self, category: BlockageCategory) -> u64 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Display rows in fixed order, ending with the total.
    pub fn rows(&self) -> Vec<(&'static str, u64)> {
        let mut rows: Vec<_> = BlockageCategory::ALL
            .iter()
            .map(|category| (category.label(), self.count(*category)))
            .collect();
        rows.push(("Total", self.total()));
        rows
    }
}

pub struct PaceMakerReader {
    dir: PathBuf,
}

impl PaceMakerReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    fn db_path(&self) -> PathBuf {
        self.dir.join("usage.db")
    }

    pub fn is_installed(&self) -> bool {
        self.dir.is_dir() && self.config_path().is_file()
    }

    fn read_config(&self) -> Option<PaceMakerConfig> {
        let raw = fs::read_to_string(self.config_path()).ok()?;
        match serde_json::from_str(&raw) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::debug!(error = %err, "pace-maker config is not valid JSON");
                None
            }
        }
    }

    fn open_db(&self) -> Option<Connection> {
        let path = self.db_path();
        if !path.is_file() {
            return None;
        }
        open_read_only(&path)
            .map_err(|err| tracing::debug!(error = %err, "pace-maker database unavailable"))
            .ok()
    }

    pub fn status(&self) -> Option<PaceMakerStatus> {
        if !self.is_installed() {
            return None;
        }
        let config = self.read_config()?;
        let latest = self.open_db().and_then(|conn| {
            latest_usage(&conn)
                .map_err(|err| tracing::debug!(error = %err, "pace-maker usage query failed"))
                .ok()
                .flatten()
        });
        Some(PaceMakerStatus {
            enabled: config.enabled,
            latest,
        })
    }

    pub fn blockage_stats_at(&self, now: DateTime<Utc>) -> Option<BlockageStats> {
        if !self.is_installed() {
            return None;
        }
        let conn = self.open_db()?;
        count_blockages(&conn, now.timestamp() - BLOCKAGE_WINDOW_SECS)
            .map_err(|err| tracing::debug!(error = %err, "pace-maker blockage query failed"))
            .ok()
    }

    pub fn blockage_stats(&self) -> Option<BlockageStats> {
        self.blockage_stats_at(Utc::now())
    }
}

fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(2))?;
    Ok(conn)
}

fn latest_usage(conn: &Connection) -> rusqlite::Result<Option<PaceMakerUsage>> {
    let row = conn
        .query_row(
            "SELECT timestamp, five_hour_util, five_hour_resets_at, seven_day_util, seven_day_resets_at
             FROM usage_snapshots
             ORDER BY timestamp DESC
             LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;

    // Pace-maker writes naive reset times in the machine's local zone.
    let reset_at = |raw: Option<String>| raw.as_deref().and_then(|r| parse_timestamp_in(r, &Local));
    Ok(row.and_then(|(ts, five_util, five_reset, seven_util, seven_reset)| {
        Some(PaceMakerUsage {
            timestamp: Utc.timestamp_opt(ts, 0).single()?,
            five_hour_util: five_util,
            five_hour_resets_at: reset_at(five_reset),
            seven_day_util: seven_util,
            seven_day_resets_at: reset_at(seven_reset),
        })
    }))
}

fn count_blockages(conn: &Connection, since: i64) -> rusqlite::Result<BlockageStats> {
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*) FROM blockage_events
         WHERE timestamp >= ?1
         GROUP BY category",
    )?;
    let rows = stmt.query_map(params![since], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut stats = BlockageStats::default();
    for row in rows {
        let (category, count) = row?;
        *stats
            .counts
            .entry(BlockageCategory::from_key(&category))
            .or_insert(0) += count.max(0) as u64;
    }
    Ok(stats)
}
