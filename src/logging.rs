use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "claude-usage.log";
const LOG_RETENTION_DAYS: u64 = 7;

struct LocalTimer;

impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().to_rfc3339())
    }
}

/// File-only logging. The terminal belongs to the dashboard, so nothing is
/// written to stdout or stderr. Keep the returned guard alive for the whole
/// run or buffered lines are lost.
pub fn init_logger(log_dir: &Path) -> Option<WorkerGuard> {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log directory {}: {err}", log_dir.display());
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_timer(LocalTimer);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(file_layer)
        .try_init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "logger initialized");
    match cleanup_old_logs(log_dir, Duration::from_secs(LOG_RETENTION_DAYS * 24 * 3600)) {
        Ok(0) => {}
        Ok(deleted) => tracing::info!(deleted, "removed expired log files"),
        Err(err) => tracing::warn!(error = %err, "log cleanup failed"),
    }

    Some(guard)
}

/// Removes rotated log files whose last modification is older than `max_age`.
pub fn cleanup_old_logs(log_dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut deleted = 0;

    for entry in fs::read_dir(log_dir)?.flatten() {
        let path = entry.path();
        let is_ours = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_ours || !path.is_file() {
            continue;
        }

        let modified = entry.metadata().and_then(|meta| meta.modified());
        if matches!(modified, Ok(ts) if ts < cutoff) {
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to delete old log"),
            }
        }
    }

    Ok(deleted)
}
