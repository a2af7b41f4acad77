//! Log setup for hosts embedding the sync engine.

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "offline-sync";
pub const MAX_LOG_FILES: usize = 7;

/// Platform log directory for the sync engine.
pub fn default_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("pos-offline-sync").join("logs")
}

/// Install the global subscriber: console output plus a daily rolling JSON
/// file in `log_dir`. Keep the returned guard alive; dropping it flushes the
/// file writer.
pub fn init(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_offline_sync=debug"));

    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    prune_old_logs(log_dir, MAX_LOG_FILES);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %log_dir.display(),
        "offline sync logging initialised"
    );
    Ok(guard)
}

/// Delete all but the newest `keep` log files. Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_prune_keeps_newest_files() {
        let dir = std::env::temp_dir().join(format!("sync-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for day in 1..=4 {
            fs::write(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-0{day}")), "x").unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.join("unrelated.txt"), "keep me").unwrap();

        assert_eq!(prune_old_logs(&dir, 2), 2);
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-04")).exists());
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-03")).exists());
        assert!(!dir.join(format!("{LOG_FILE_PREFIX}.2026-01-01")).exists());
        assert!(dir.join("unrelated.txt").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = std::env::temp_dir().join(format!("sync-logs-missing-{}", uuid::Uuid::new_v4()));
        assert_eq!(prune_old_logs(&dir, 1), 0);
    }
}
