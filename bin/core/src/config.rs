use std::path::PathBuf;

use anyhow::Context;
use colored::Colorize;
use rsgo_client::entities::{
  config::CoreConfig,
  logger::{LogLevel, StdioLogMode},
};
use serde::Deserialize;

/// Env overrides recognized on top of the config file.
#[derive(Debug, Deserialize)]
struct Env {
  #[serde(default)]
  rsgo_config_path: Option<PathBuf>,
  #[serde(default)]
  rsgo_monitoring_interval_secs: Option<u64>,
  #[serde(default)]
  rsgo_start_timeout_secs: Option<u64>,
  #[serde(default)]
  rsgo_pull_fanout: Option<usize>,
  #[serde(default)]
  rsgo_allowed_volume_roots: Option<Vec<String>>,
  #[serde(default)]
  rsgo_log_level: Option<LogLevel>,
  #[serde(default)]
  rsgo_log_stdio: Option<StdioLogMode>,
  #[serde(default)]
  rsgo_otlp_endpoint: Option<String>,
}

/// Load the immutable process configuration: optional TOML file
/// at `RSGO_CONFIG_PATH`, overridden field-by-field from the
/// environment. The result is built once at startup and handed
/// to the supervisor; nothing re-reads it.
pub fn load_config() -> anyhow::Result<CoreConfig> {
  let env: Env = envy::from_env()
    .context("failed to parse ReadyStackGo environment")?;

  let mut config = match &env.rsgo_config_path {
    Some(path) => {
      let raw =
        std::fs::read_to_string(path).with_context(|| {
          format!("failed to read config file {path:?}")
        })?;
      toml::from_str::<CoreConfig>(&raw).with_context(|| {
        format!("failed to parse config file {path:?}")
      })?
    }
    None => {
      println!(
        "{}: no RSGO_CONFIG_PATH set, using default config",
        "INFO".green(),
      );
      CoreConfig::default()
    }
  };

  if let Some(interval) = env.rsgo_monitoring_interval_secs {
    config.monitoring_interval_secs = interval;
  }
  if let Some(timeout) = env.rsgo_start_timeout_secs {
    config.start_timeout_secs = timeout;
  }
  if let Some(fanout) = env.rsgo_pull_fanout {
    config.pull_fanout = fanout;
  }
  if let Some(roots) = env.rsgo_allowed_volume_roots {
    config.allowed_volume_roots = roots;
  }
  if let Some(level) = env.rsgo_log_level {
    config.logging.level = level;
  }
  if let Some(stdio) = env.rsgo_log_stdio {
    config.logging.stdio = stdio;
  }
  if let Some(endpoint) = env.rsgo_otlp_endpoint {
    config.logging.otlp_endpoint = endpoint;
  }

  Ok(config)
}
