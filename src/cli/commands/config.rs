//! Config command implementations.

use serde::Serialize;

use super::print_json;
use crate::cli::ConfigCommands;
use crate::config::settings::{load_settings_from, settings_path};
use crate::config::{load_settings, save_settings, Settings};
use crate::error::{Error, Result};

#[derive(Serialize)]
struct SettingsOutput<'a> {
    instance_url: Option<&'a str>,
    access_token: Option<String>,
    api_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

impl<'a> SettingsOutput<'a> {
    fn new(settings: &'a Settings, path: Option<String>) -> Self {
        Self {
            instance_url: settings.instance_url.as_deref(),
            access_token: settings.access_token.as_deref().map(mask),
            api_version: &settings.api_version,
            path,
        }
    }
}

/// Keep the last four characters of a secret.
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

/// Execute config commands.
pub fn execute(command: &ConfigCommands, json: bool) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let settings = load_settings()?;
            let output = SettingsOutput::new(&settings, None);
            if json {
                return print_json(&output);
            }
            println!("instance_url: {}", output.instance_url.unwrap_or("(not set)"));
            println!("access_token: {}", output.access_token.as_deref().unwrap_or("(not set)"));
            println!("api_version:  {}", output.api_version);
            Ok(())
        }
        ConfigCommands::Set {
            instance_url,
            access_token,
            api_version,
        } => {
            if instance_url.is_none() && access_token.is_none() && api_version.is_none() {
                return Err(Error::InvalidArgument("nothing to set".to_string()));
            }
            // Start from the file alone so env overrides are not persisted.
            let mut settings = match settings_path() {
                Some(path) => load_settings_from(&path)?,
                None => Settings::default(),
            };
            if let Some(url) = instance_url {
                settings.instance_url = Some(url.trim_end_matches('/').to_string());
            }
            if let Some(token) = access_token {
                settings.access_token = Some(token.clone());
            }
            if let Some(version) = api_version {
                settings.api_version.clone_from(version);
            }
            let path = save_settings(&settings)?;
            if json {
                return print_json(&SettingsOutput::new(&settings, Some(path.display().to_string())));
            }
            println!("Saved settings to {}", path.display());
            Ok(())
        }
    }
}
