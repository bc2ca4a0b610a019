//! Configuration management.
//!
//! This module resolves the database path and loads remote settings.
//!
//! # Layout
//!
//! - **Database**: `~/.soupsync/data/soupsync.db` unless overridden
//! - **Settings**: `~/.soupsync/config.json` (see [`settings`])

pub mod settings;

pub use settings::{load_settings, save_settings, Settings, DEFAULT_API_VERSION};

use std::path::{Path, PathBuf};

/// Get the global soupsync directory location (`~/.soupsync/`).
#[must_use]
pub fn global_soupsync_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".soupsync"))
}

/// Resolve the database path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `SOUPSYNC_DB` environment variable
/// 3. Global location: `~/.soupsync/data/soupsync.db`
///
/// # Returns
///
/// Returns the path to the database file, or `None` if no location found.
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Ok(db_path) = std::env::var("SOUPSYNC_DB") {
        if !db_path.trim().is_empty() {
            return Some(PathBuf::from(db_path));
        }
    }

    global_soupsync_dir().map(|dir| dir.join("data").join("soupsync.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_db_path_with_explicit() {
        let explicit = PathBuf::from("/custom/path/db.sqlite");
        let result = resolve_db_path(Some(&explicit));
        assert_eq!(result, Some(explicit));
    }

    #[test]
    fn test_resolve_db_path_default_name() {
        if std::env::var("SOUPSYNC_DB").is_ok() {
            return;
        }
        let path = resolve_db_path(None).unwrap();
        assert!(path.ends_with("soupsync.db"));
    }

    #[test]
    fn test_global_dir_returns_some() {
        assert!(global_soupsync_dir().is_some());
    }
}
