//! Remote connection settings.
//!
//! Stored as pretty JSON in `~/.soupsync/config.json`. Every field can be
//! overridden from the environment:
//!
//! | Field | Variable |
//! |---|---|
//! | `instance_url` | `SOUPSYNC_INSTANCE_URL` |
//! | `access_token` | `SOUPSYNC_ACCESS_TOKEN` |
//! | `api_version` | `SOUPSYNC_API_VERSION` |

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// API version used when none is configured.
pub const DEFAULT_API_VERSION: &str = "v60.0";

/// Settings for reaching the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instance_url: None,
            access_token: None,
            api_version: default_api_version(),
        }
    }
}

impl Settings {
    /// Apply `SOUPSYNC_*` overrides from the environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = var("SOUPSYNC_INSTANCE_URL") {
            self.instance_url = Some(url);
        }
        if let Some(token) = var("SOUPSYNC_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }
        if let Some(version) = var("SOUPSYNC_API_VERSION") {
            self.api_version = version;
        }
        self
    }

    /// Instance URL, or a config error naming how to set it.
    pub fn require_instance_url(&self) -> Result<&str> {
        self.instance_url.as_deref().ok_or_else(|| {
            Error::Config(
                "no instance URL configured (set SOUPSYNC_INSTANCE_URL or instance_url in config.json)"
                    .to_string(),
            )
        })
    }

    /// Access token, or a config error naming how to set it.
    pub fn require_access_token(&self) -> Result<&str> {
        self.access_token.as_deref().ok_or_else(|| {
            Error::Config(
                "no access token configured (set SOUPSYNC_ACCESS_TOKEN or access_token in config.json)"
                    .to_string(),
            )
        })
    }
}

/// Default settings file location.
#[must_use]
pub fn settings_path() -> Option<PathBuf> {
    super::global_soupsync_dir().map(|dir| dir.join("config.json"))
}

/// Load settings from the default location, then apply env overrides.
///
/// A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_settings() -> Result<Settings> {
    let settings = match settings_path() {
        Some(path) => load_settings_from(&path)?,
        None => Settings::default(),
    };
    Ok(settings.with_env_overrides())
}

/// Load settings from `path` without env overrides.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("invalid settings file {}: {e}", path.display())))
}

/// Save settings to the default location.
///
/// # Errors
///
/// Returns an error if no home directory is known or the write fails.
pub fn save_settings(settings: &Settings) -> Result<PathBuf> {
    let path = settings_path()
        .ok_or_else(|| Error::Config("could not determine home directory".to_string()))?;
    save_settings_to(settings, &path)?;
    Ok(path)
}

/// Write settings to `path`: temp file, then atomic rename. The file holds a
/// token, so it is created owner-only.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the write fails.
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    let temp_path = path.with_extension("json.tmp");
    {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts.open(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.flush()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.api_version, "v60.0");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let settings = Settings {
            instance_url: Some("https://example.my.salesforce.com".into()),
            access_token: Some("token".into()),
            api_version: "v59.0".into(),
        };
        save_settings_to(&settings, &path).unwrap();
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(matches!(load_settings_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::default().with_overrides(|key| match key {
            "SOUPSYNC_INSTANCE_URL" => Some("https://override".into()),
            "SOUPSYNC_API_VERSION" => Some("  ".into()),
            _ => None,
        });
        assert_eq!(settings.instance_url.as_deref(), Some("https://override"));
        assert_eq!(settings.api_version, DEFAULT_API_VERSION);
        assert!(settings.require_access_token().is_err());
    }
}
