//! End-of-game log persistence and archive access.
//!
//! Each finished (or failed) game is written as pretty JSON to
//! `{log_dir}/{mode}-{id}.json`. The write goes to a `.json.tmp` file
//! first and is renamed into place, so readers never see a partial log.

use std::path::{Path, PathBuf};

use arena_types::{ArenaError, Result};

use crate::state::GameSnapshot;

/// Pseudo log id for the game currently mounted in the engine.
pub const CURRENT_LOG_ID: &str = "current";

const LOG_EXTENSION: &str = "json";

/// Path of the log for game `id` in `mode`.
pub fn log_path(dir: &Path, mode: &str, id: &str) -> PathBuf {
    dir.join(format!("{mode}-{id}.{LOG_EXTENSION}"))
}

/// Writes a snapshot to its log file, creating `dir` if needed.
pub fn write_game_log(dir: &Path, mode: &str, id: &str, snapshot: &GameSnapshot) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| ArenaError::StorageError {
        reason: format!("failed to create log dir {}: {e}", dir.display()),
    })?;

    let json = serde_json::to_string_pretty(snapshot).map_err(|e| ArenaError::StorageError {
        reason: format!("game log serialization failed: {e}"),
    })?;

    let path = log_path(dir, mode, id);
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ArenaError::StorageError {
        reason: format!("failed to write game log: {e}"),
    })?;

    std::fs::rename(&tmp_path, &path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        ArenaError::StorageError {
            reason: format!("failed to rename game log: {e}"),
        }
    })?;

    tracing::info!(path = %path.display(), "game log saved");
    Ok(path)
}

/// Lists available logs: [`CURRENT_LOG_ID`] first, then every archived
/// log id (file stem) in `dir`, sorted. A missing directory has no
/// archived logs.
pub fn list_game_logs(dir: &Path) -> Result<Vec<String>> {
    let mut ids = vec![CURRENT_LOG_ID.to_string()];

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => {
            return Err(ArenaError::StorageError {
                reason: format!("failed to list {}: {e}", dir.display()),
            })
        }
    };

    let mut archived: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == LOG_EXTENSION))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    archived.sort();
    ids.extend(archived);
    Ok(ids)
}

/// Loads the archived log `id` from `dir`.
///
/// Ids are file stems; anything that could leave `dir` is rejected.
pub fn read_game_log(dir: &Path, id: &str) -> Result<GameSnapshot> {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(ArenaError::StorageError {
            reason: format!("invalid game log id '{id}'"),
        });
    }

    let path = dir.join(format!("{id}.{LOG_EXTENSION}"));
    let json = std::fs::read_to_string(&path).map_err(|e| ArenaError::StorageError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    serde_json::from_str(&json).map_err(|e| ArenaError::StorageError {
        reason: format!("invalid game log {}: {e}", path.display()),
    })
}
