//! Rate estimation over stored snapshots and forward projection.

use crate::error::StoreError;
use crate::models::Projection;
use crate::storage::{earliest_in, Measure, SnapshotStore};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::time::Duration;

/// Lookback windows tried in order until one holds a prior snapshot.
pub const RATE_WINDOWS: [Duration; 6] = [
    Duration::from_secs(30 * 60),
    Duration::from_secs(3600),
    Duration::from_secs(3 * 3600),
    Duration::from_secs(6 * 3600),
    Duration::from_secs(24 * 3600),
    Duration::from_secs(7 * 24 * 3600),
];

pub struct RateEstimator<'a> {
    store: &'a SnapshotStore,
    floor: Option<i64>,
}

impl<'a> RateEstimator<'a> {
    pub fn new(store: &'a SnapshotStore) -> Self {
        Self { store, floor: None }
    }

    /// Ignores snapshots older than `start`, for a series whose meaning
    /// changed at that instant.
    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.floor = Some(start.timestamp());
        self
    }

    /// Per-hour growth of `measure` ending at `current`.
    ///
    /// `Ok(None)` means no window held a usable snapshot; `Ok(Some(0.0))`
    /// means history exists but the value did not grow. All windows are
    /// searched on one read snapshot.
    pub fn try_rate_at(
        &self,
        measure: Measure,
        current: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError> {
        let Some(current) = current else {
            return Ok(None);
        };
        let now_ts = now.timestamp();

        self.store.with_read_connection(|conn| {
            for window in RATE_WINDOWS {
                let mut cutoff = now_ts - window.as_secs() as i64;
                if let Some(floor) = self.floor {
                    cutoff = cutoff.max(floor);
                }
                let Some((old_ts, old_value)) = earliest_in(conn, measure, cutoff)? else {
                    continue;
                };

                // Same second, or a row from ahead of a clock that stepped back.
                let elapsed = now_ts - old_ts;
                if elapsed <= 0 {
                    continue;
                }

                let delta = current - old_value;
                if delta <= 0.0 {
                    return Ok(Some(0.0));
                }

                let rate = delta / elapsed as f64 * 3600.0;
                tracing::debug!(
                    measure = measure.as_label(),
                    window_secs = window.as_secs(),
                    elapsed,
                    rate,
                    "estimated rate"
                );
                return Ok(Some(rate));
            }

            Ok(None)
        })
    }

    pub fn rate_at(&self, measure: Measure, current: Option<f64>, now: DateTime<Utc>) -> Option<f64> {
        match self.try_rate_at(measure, current, now) {
            Ok(rate) => rate,
            Err(StoreError::Unavailable) => None,
            Err(err) => {
                tracing::error!(measure = measure.as_label(), error = %err, "rate estimation failed");
                None
            }
        }
    }

    pub fn rate(&self, measure: Measure, current: Option<f64>) -> Option<f64> {
        self.rate_at(measure, current, Utc::now())
    }
}

pub fn project_at(
    current: f64,
    rate_per_hour: Option<f64>,
    boundary: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<Projection> {
    let hours = (boundary - now).num_milliseconds() as f64 / 3_600_000.0;

    // Never extrapolate backwards.
    if hours < 0.0 {
        return Some(Projection {
            current_value: current,
            projected_value: current,
            rate_per_hour: rate_per_hour.unwrap_or(0.0),
            hours_until_boundary: 0.0,
        });
    }

    let rate = rate_per_hour?;
    Some(Projection {
        current_value: current,
        projected_value: current + rate * hours,
        rate_per_hour: rate,
        hours_until_boundary: hours,
    })
}

pub fn project(current: f64, rate_per_hour: Option<f64>, boundary: DateTime<Utc>) -> Option<Projection> {
    project_at(current, rate_per_hour, boundary, Utc::now())
}

/// Parses a `resets_at` value. Offsets are honored; naive timestamps are
/// taken as UTC.
pub fn parse_reset_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_timestamp_in(raw, &Utc)
}

/// Like [`parse_reset_timestamp`], but a naive timestamp is wall-clock time
/// in `tz`. Ambiguous local times resolve to the earlier instant.
pub fn parse_timestamp_in<Tz: TimeZone>(raw: &str, tz: &Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
}

/// 23:59:59 on the last day of `now`'s month, in `now`'s time zone.
pub fn end_of_month<Tz: TimeZone>(now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let (year, month) = (now.year(), now.month());
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last_day = first_of_next.pred_opt()?;
    let naive = last_day.and_hms_opt(23, 59, 59)?;
    now.timezone().from_local_datetime(&naive).earliest()
}

pub fn local_end_of_month_utc(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    end_of_month(&now.with_timezone(&Local)).map(|eom| eom.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_RETENTION;
    use crate::models::{CostObservation, UsageObservation};
    use chrono::{Duration as ChronoDuration, FixedOffset, Timelike};
    use tempfile::TempDir;

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0)
            .single()
            .expect("valid fixed timestamp")
    }

    fn open_store(tmp: &TempDir) -> SnapshotStore {
        SnapshotStore::open(&tmp.path().join("usage_history.db"), DEFAULT_RETENTION)
            .expect("open store")
    }

    fn seed_cost(store: &SnapshotStore, at: DateTime<Utc>, value: f64) {
        assert!(store.store_console_snapshot_at(
            &CostObservation {
                mtd_cost: Some(value)
            },
            None,
            at
        ));
    }

    fn seed_credits(store: &SnapshotStore, at: DateTime<Utc>, value: i64) {
        assert!(store.store_usage_snapshot_at(
            &UsageObservation {
                credits_used: Some(value),
                utilization_percent: None,
                resets_at: None,
            },
            at
        ));
    }

    #[test]
    fn empty_history_has_no_rate() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let estimator = RateEstimator::new(&store);

        for value in [0.0, 10.0, 1_000.0] {
            assert_eq!(estimator.rate_at(Measure::MtdCost, Some(value), fixed_now()), None);
        }
    }

    #[test]
    fn missing_current_value_short_circuits() {
        let estimator_store = SnapshotStore::disabled();
        let estimator = RateEstimator::new(&estimator_store);
        assert!(matches!(
            estimator.try_rate_at(Measure::Credits, None, fixed_now()),
            Ok(None)
        ));
        assert!(matches!(
            estimator.try_rate_at(Measure::Credits, Some(1.0), fixed_now()),
            Err(StoreError::Unavailable)
        ));
    }

    #[test]
    fn thirty_minute_history_yields_hourly_rate() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_cost(&store, now - ChronoDuration::minutes(30), 10.0);

        let rate = RateEstimator::new(&store)
            .rate_at(Measure::MtdCost, Some(15.0), now)
            .expect("rate");
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn smallest_window_with_data_wins() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_cost(&store, now - ChronoDuration::hours(3), 1.0);
        seed_cost(&store, now - ChronoDuration::minutes(20), 8.0);

        let rate = RateEstimator::new(&store)
            .rate_at(Measure::MtdCost, Some(10.0), now)
            .expect("rate");
        // (10 - 8) over 20 minutes
        assert!((rate - 6.0).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_wider_windows_after_a_gap() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_cost(&store, now - ChronoDuration::hours(5), 5.0);

        let rate = RateEstimator::new(&store)
            .rate_at(Measure::MtdCost, Some(15.0), now)
            .expect("rate from six hour window");
        assert!((rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn week_old_history_is_the_last_resort() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_credits(&store, now - ChronoDuration::days(6), 0);

        let rate = RateEstimator::new(&store)
            .rate_at(Measure::Credits, Some(144.0), now)
            .expect("rate from seven day window");
        assert!((rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unchanged_value_is_zero_rate() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_cost(&store, now - ChronoDuration::hours(2), 10.0);

        let rate = RateEstimator::new(&store).rate_at(Measure::MtdCost, Some(10.0), now);
        assert_eq!(rate, Some(0.0));
    }

    #[test]
    fn decreasing_value_is_zero_rate() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_cost(&store, now - ChronoDuration::minutes(10), 10.0);

        let rate = RateEstimator::new(&store).rate_at(Measure::MtdCost, Some(8.0), now);
        assert_eq!(rate, Some(0.0));
    }

    #[test]
    fn same_second_snapshot_is_skipped() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_cost(&store, now, 10.0);

        let rate = RateEstimator::new(&store).rate_at(Measure::MtdCost, Some(12.0), now);
        assert_eq!(rate, None);
    }

    #[test]
    fn snapshot_from_the_future_is_skipped() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_credits(&store, now + ChronoDuration::seconds(60), 10);

        let estimator = RateEstimator::new(&store);
        assert_eq!(estimator.rate_at(Measure::Credits, Some(20.0), now), None);
    }

    #[test]
    fn clock_step_back_falls_through_to_older_history() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_credits(&store, now - ChronoDuration::minutes(45), 5);
        seed_credits(&store, now + ChronoDuration::minutes(2), 18);

        let rate = RateEstimator::new(&store)
            .rate_at(Measure::Credits, Some(20.0), now)
            .expect("rate from one hour window");
        // (20 - 5) over 45 minutes
        assert!((rate - 20.0).abs() < 1e-9);
    }

    #[test]
    fn rate_is_estimated_while_another_connection_writes() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("usage_history.db");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_credits(&store, now - ChronoDuration::minutes(30), 10);

        let writer = rusqlite::Connection::open(&path).expect("open writer");
        writer
            .execute_batch(&format!(
                "BEGIN IMMEDIATE;
                 INSERT INTO usage_snapshots (timestamp, credits_used) VALUES ({}, 15);",
                now.timestamp() - 60
            ))
            .expect("hold write lock");

        let started = std::time::Instant::now();
        let rate = RateEstimator::new(&store).try_rate_at(Measure::Credits, Some(20.0), now);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "estimator blocked for {:?}",
            started.elapsed()
        );
        let rate = rate.expect("read under lock").expect("rate");
        assert!((rate - 20.0).abs() < 1e-9);

        writer.execute_batch("ROLLBACK;").expect("release lock");
    }

    #[test]
    fn series_start_hides_older_snapshots() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_cost(&store, now - ChronoDuration::minutes(20), 80.0);
        seed_cost(&store, now - ChronoDuration::minutes(5), 4.0);

        let plain = RateEstimator::new(&store).rate_at(Measure::MtdCost, Some(5.0), now);
        assert_eq!(plain, Some(0.0));

        let rate = RateEstimator::new(&store)
            .since(now - ChronoDuration::minutes(5))
            .rate_at(Measure::MtdCost, Some(5.0), now)
            .expect("rate within the new series");
        assert!((rate - 12.0).abs() < 1e-9);
    }

    #[test]
    fn measures_do_not_leak_across_tables() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_credits(&store, now - ChronoDuration::minutes(15), 10);

        let estimator = RateEstimator::new(&store);
        assert_eq!(estimator.rate_at(Measure::MtdCost, Some(20.0), now), None);
        assert_eq!(estimator.rate_at(Measure::Utilization, Some(20.0), now), None);
        assert!(estimator.rate_at(Measure::Credits, Some(20.0), now).is_some());
    }

    #[test]
    fn projection_is_linear() {
        let now = fixed_now();
        let boundary = now + ChronoDuration::hours(360);
        let projection = project_at(10.0, Some(2.0), boundary, now).expect("projection");
        assert_eq!(projection.projected_value, 730.0);
        assert_eq!(projection.hours_until_boundary, 360.0);
        assert_eq!(projection.increase(), 720.0);
    }

    #[test]
    fn zero_rate_projects_current_value() {
        let now = fixed_now();
        let projection =
            project_at(10.0, Some(0.0), now + ChronoDuration::hours(360), now).expect("projection");
        assert_eq!(projection.projected_value, 10.0);
    }

    #[test]
    fn past_boundary_returns_current_value() {
        let now = fixed_now();
        let boundary = now - ChronoDuration::hours(10);

        let projection = project_at(10.0, Some(2.0), boundary, now).expect("clamped projection");
        assert_eq!(projection.projected_value, 10.0);
        assert_eq!(projection.hours_until_boundary, 0.0);

        let without_rate = project_at(10.0, None, boundary, now).expect("clamped projection");
        assert_eq!(without_rate.projected_value, 10.0);
    }

    #[test]
    fn missing_rate_has_no_projection() {
        let now = fixed_now();
        assert_eq!(project_at(10.0, None, now + ChronoDuration::hours(1), now), None);
    }

    #[test]
    fn stored_history_projects_to_reset() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = fixed_now();
        seed_credits(&store, now - ChronoDuration::seconds(1800), 100);
        seed_credits(&store, now, 200);

        let rate = RateEstimator::new(&store).rate_at(Measure::Credits, Some(200.0), now);
        assert!(rate.is_some_and(|r| (r - 200.0).abs() < 1e-9));

        let resets_at = (now + ChronoDuration::hours(2)).to_rfc3339();
        let boundary = parse_reset_timestamp(&resets_at).expect("parse reset");
        let projection = project_at(200.0, rate, boundary, now).expect("projection");
        assert!((projection.projected_value - 600.0).abs() < 1e-9);
    }

    #[test]
    fn reset_timestamps_parse_with_and_without_offsets() {
        let expected = Utc.with_ymd_and_hms(2025, 11, 20, 15, 0, 0).single().expect("ts");
        assert_eq!(parse_reset_timestamp("2025-11-20T15:00:00+00:00"), Some(expected));
        assert_eq!(parse_reset_timestamp("2025-11-20T15:00:00Z"), Some(expected));
        assert_eq!(parse_reset_timestamp("2025-11-20T17:00:00+02:00"), Some(expected));
        assert_eq!(parse_reset_timestamp("2025-11-20T15:00:00.000000"), Some(expected));
        assert_eq!(parse_reset_timestamp("soon"), None);
        assert_eq!(parse_reset_timestamp(""), None);
    }

    #[test]
    fn naive_timestamps_follow_the_given_zone() {
        let plus_two = FixedOffset::east_opt(2 * 3600).expect("offset");
        let expected = Utc.with_ymd_and_hms(2025, 11, 20, 15, 0, 0).single().expect("ts");
        assert_eq!(parse_timestamp_in("2025-11-20T17:00:00", &plus_two), Some(expected));
        assert_eq!(
            parse_timestamp_in("2025-11-20 17:00:00.5", &plus_two),
            Some(expected + ChronoDuration::milliseconds(500))
        );
        assert_eq!(parse_timestamp_in("2025-11-20T15:00:00Z", &plus_two), Some(expected));
    }

    #[test]
    fn end_of_month_handles_month_lengths() {
        let utc = FixedOffset::east_opt(0).expect("offset");
        let cases = [
            ((2025, 1, 15), (2025, 1, 31)),
            ((2024, 2, 10), (2024, 2, 29)),
            ((2025, 2, 28), (2025, 2, 28)),
            ((2025, 4, 1), (2025, 4, 30)),
            ((2025, 12, 31), (2025, 12, 31)),
        ];
        for ((y, m, d), (ey, em, ed)) in cases {
            let now = utc.with_ymd_and_hms(y, m, d, 8, 30, 0).single().expect("now");
            let eom = end_of_month(&now).expect("eom");
            assert_eq!((eom.year(), eom.month(), eom.day()), (ey, em, ed));
            assert_eq!((eom.hour(), eom.minute(), eom.second()), (23, 59, 59));
        }
    }

    #[test]
    fn end_of_month_respects_the_offset() {
        let tz = FixedOffset::east_opt(9 * 3600).expect("offset");
        let now = tz.with_ymd_and_hms(2025, 3, 31, 23, 0, 0).single().expect("now");
        let eom = end_of_month(&now).expect("eom");
        assert_eq!(eom - now, ChronoDuration::seconds(59 * 60 + 59));
    }
}
