//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use garage_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, remote_url, remote_api_key, sync_enabled, \
     auto_sync_interval_secs, max_retries, request_timeout_secs, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    let api_key = config.remote_api_key.as_deref().map(mask_secret);

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "remote_url": config.remote_url,
                    "remote_api_key": api_key,
                    "sync_enabled": config.sync_enabled,
                    "auto_sync_interval_secs": config.auto_sync_interval_secs,
                    "max_retries": config.max_retries,
                    "request_timeout_secs": config.request_timeout_secs,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:                {}", config.data_dir.display());
            println!(
                "  remote_url:              {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  remote_api_key:          {}",
                api_key.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled:            {}", config.sync_enabled);
            println!("  auto_sync_interval_secs: {}", config.auto_sync_interval_secs);
            println!("  max_retries:             {}", config.max_retries);
            println!("  request_timeout_secs:    {}", config.request_timeout_secs);
            println!(
                "  log_file:                {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply_setting(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "remote_api_key" {
        mask_secret(&value)
    } else {
        value
    };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

fn apply_setting(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "remote_url" => {
            config.remote_url = optional(value);
        }
        "remote_api_key" => {
            config.remote_api_key = optional(value);
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "auto_sync_interval_secs" => {
            config.auto_sync_interval_secs = value
                .parse()
                .context("Invalid value for auto_sync_interval_secs. Use a number of seconds.")?;
        }
        "max_retries" => {
            config.max_retries = value
                .parse()
                .context("Invalid value for max_retries. Use a whole number.")?;
        }
        "request_timeout_secs" => {
            config.request_timeout_secs = value
                .parse()
                .context("Invalid value for request_timeout_secs. Use a number of seconds.")?;
        }
        "log_file" => {
            config.log_file = optional(value).map(PathBuf::from);
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

/// Empty and `none` clear an optional setting
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_setting() {
        let mut config = Config::default();

        apply_setting(&mut config, "remote_url", "https://db.example.com").unwrap();
        apply_setting(&mut config, "sync_enabled", "true").unwrap();
        apply_setting(&mut config, "max_retries", "5").unwrap();

        assert_eq!(config.remote_url.as_deref(), Some("https://db.example.com"));
        assert!(config.sync_enabled);
        assert_eq!(config.max_retries, 5);

        apply_setting(&mut config, "remote_url", "none").unwrap();
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_apply_setting_rejects_bad_input() {
        let mut config = Config::default();

        assert!(apply_setting(&mut config, "sync_enabled", "sometimes").is_err());
        assert!(apply_setting(&mut config, "max_retries", "-1").is_err());

        let err = apply_setting(&mut config, "favorite_color", "blue").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_set_persists_to_cli_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        let data_dir = temp_dir.path().join("data");
        std::fs::write(&path, format!("data_dir = {:?}\n", data_dir)).unwrap();
        let output = Output::new(OutputFormat::Quiet);

        set(
            "request_timeout_secs".to_string(),
            "20".to_string(),
            Some(&path),
            &output,
        )
        .unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.request_timeout_secs, 20);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk_live_12345"), "sk_l****");
        assert_eq!(mask_secret("ab"), "ab****");
    }
}
