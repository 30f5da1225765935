//! Diagnostics for the sync runtime.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, database size, sync counters and the
//!   most recent submission errors
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db;
use crate::models::OrderStatus;
use crate::orders::OrderResult;
use crate::sync::SyncEngine;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Rolling log file prefix.
pub const LOG_FILE_PREFIX: &str = "preventa";

/// Number of failed orders listed in the health snapshot.
const RECENT_ERRORS: usize = 20;

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

/// Per-user data directory (`%LOCALAPPDATA%`, `$XDG_DATA_HOME` or
/// `~/.local/share`, then `preventa`).
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("preventa")
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Prune old log files, keeping only the most recent [`MAX_LOG_FILES`].
/// Returns the number of files removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Health snapshot for support screens and the `--health` CLI flag.
pub fn get_system_health(engine: &SyncEngine) -> OrderResult<Value> {
    let db = engine.orders().db();
    let schema_version = {
        let conn = db.lock()?;
        db::schema_version(&conn)?
    }; // lock released before the engine takes its own
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    let status = engine.status()?;

    let mut failed: Vec<_> = engine
        .orders()
        .list_orders()?
        .into_iter()
        .filter(|order| order.status == OrderStatus::Failed)
        .collect();
    failed.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    let recent_errors: Vec<Value> = failed
        .iter()
        .take(RECENT_ERRORS)
        .map(|order| {
            json!({
                "localId": order.local_id,
                "attempts": order.attempts,
                "lastError": order.last_error,
                "modifiedAt": order.modified_at,
            })
        })
        .collect();

    Ok(json!({
        "schemaVersion": schema_version,
        "dbSizeBytes": db_size,
        "sync": status,
        "recentErrors": recent_errors,
    }))
}
