//! Configuration management commands.
//!
//! Stores CLI configuration in `~/.conveyor/config.toml`.

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a configuration value
    Set {
        key: ConfigKey,
        /// Value to set
        value: String,
    },

    /// Get a configuration value
    Get { key: ConfigKey },

    /// Show all configuration
    Show,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

/// Keys understood by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigKey {
    /// Base URL of the Conveyor server
    ApiUrl,
}

/// Persistent CLI configuration stored on disk.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl CliConfig {
    fn get(&self, key: ConfigKey) -> Option<&str> {
        match key {
            ConfigKey::ApiUrl => self.api_url.as_deref(),
        }
    }

    fn set(&mut self, key: ConfigKey, value: String) -> Result<()> {
        match key {
            ConfigKey::ApiUrl => {
                if !(value.starts_with("http://") || value.starts_with("https://")) {
                    anyhow::bail!("api-url must start with http:// or https://");
                }
                self.api_url = Some(value);
            }
        }
        Ok(())
    }
}

fn key_name(key: ConfigKey) -> &'static str {
    match key {
        ConfigKey::ApiUrl => "api-url",
    }
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".conveyor").join("config.toml"))
}

/// Load the CLI configuration, returning defaults if the file does not exist.
fn load_config(path: &Path) -> Result<CliConfig> {
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Save the CLI configuration, creating the directory if needed.
fn save_config(path: &Path, cfg: &CliConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// The `api-url` value from the config file, if set.
pub fn load_api_url() -> Option<String> {
    let path = config_path().ok()?;
    load_config(&path).ok().and_then(|cfg| cfg.api_url)
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    let path = config_path()?;

    match cmd {
        ConfigCommands::Set { key, value } => {
            let mut cfg = load_config(&path)?;
            cfg.set(key, value.clone())?;
            save_config(&path, &cfg)?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("{} = {}", key_name(key), value))
                }
                _ => output::print_item(
                    &serde_json::json!({ "key": key_name(key), "value": value }),
                    format,
                )?,
            }
        }

        ConfigCommands::Get { key } => {
            let cfg = load_config(&path)?;
            let value = cfg
                .get(key)
                .with_context(|| format!("Key '{}' is not set", key_name(key)))?;
            match format {
                OutputFormat::Table => println!("{}", value),
                _ => output::print_item(
                    &serde_json::json!({ "key": key_name(key), "value": value }),
                    format,
                )?,
            }
        }

        ConfigCommands::Show => {
            let cfg = load_config(&path)?;
            if cfg == CliConfig::default() {
                output::print_info("No configuration values set.");
                return Ok(());
            }

            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    if let Some(url) = &cfg.api_url {
                        output::print_detail(key_name(ConfigKey::ApiUrl), url);
                    }
                }
                _ => output::print_item(&cfg, format)?,
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This will reset all CLI configuration. Use --force to confirm.");
                return Ok(());
            }

            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("conveyor-cli-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        assert_eq!(load_config(&path).unwrap(), CliConfig::default());

        let mut cfg = CliConfig::default();
        cfg.set(ConfigKey::ApiUrl, "http://jobs.internal:8080".into()).unwrap();
        save_config(&path, &cfg).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.get(ConfigKey::ApiUrl), Some("http://jobs.internal:8080"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("api-url"));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_set_rejects_non_http_url() {
        let mut cfg = CliConfig::default();
        assert!(cfg.set(ConfigKey::ApiUrl, "localhost:8080".into()).is_err());
        assert!(cfg.api_url.is_none());
    }
}
