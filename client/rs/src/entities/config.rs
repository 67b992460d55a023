use serde::{Deserialize, Serialize};

use super::logger::LogConfig;

/// Immutable process configuration, loaded once at startup.
/// Everything tunable about timeouts, fan-out and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
  /// Seconds between health reconciles per environment.
  /// Jittered ±10% to avoid thundering herds.
  #[serde(default = "default_monitoring_interval_secs")]
  pub monitoring_interval_secs: u64,

  /// How long a started service may take to become healthy
  /// (or running-without-restart when it has no healthcheck).
  #[serde(default = "default_start_timeout_secs")]
  pub start_timeout_secs: u64,

  /// Max images pulled concurrently within one operation.
  #[serde(default = "default_pull_fanout")]
  pub pull_fanout: usize,

  /// Deadline for the whole PullingImages phase.
  #[serde(default = "default_pull_timeout_secs")]
  pub pull_timeout_secs: u64,

  /// Deadline for the whole InitializingContainers phase.
  #[serde(default = "default_init_timeout_secs")]
  pub init_timeout_secs: u64,

  /// Graceful stop window before the engine kills a container.
  #[serde(default = "default_stop_grace_secs")]
  pub stop_grace_secs: u64,

  /// Ring size of retained health samples per deployment.
  #[serde(default = "default_health_history_samples")]
  pub health_history_samples: usize,

  /// How long a terminal progress event stays observable
  /// for reconnecting subscribers.
  #[serde(default = "default_progress_retention_secs")]
  pub progress_retention_secs: u64,

  /// Per subscriber queue bound on the progress bus.
  #[serde(default = "default_progress_queue_capacity")]
  pub progress_queue_capacity: usize,

  /// Host path prefixes bind mounts may reference.
  /// Empty forbids absolute host paths entirely.
  #[serde(default)]
  pub allowed_volume_roots: Vec<String>,

  #[serde(default)]
  pub logging: LogConfig,
}

fn default_monitoring_interval_secs() -> u64 {
  10
}
fn default_start_timeout_secs() -> u64 {
  120
}
fn default_pull_fanout() -> usize {
  4
}
fn default_pull_timeout_secs() -> u64 {
  900
}
fn default_init_timeout_secs() -> u64 {
  600
}
fn default_stop_grace_secs() -> u64 {
  10
}
fn default_health_history_samples() -> usize {
  288
}
fn default_progress_retention_secs() -> u64 {
  300
}
fn default_progress_queue_capacity() -> usize {
  256
}

impl Default for CoreConfig {
  fn default() -> Self {
    Self {
      monitoring_interval_secs: default_monitoring_interval_secs(),
      start_timeout_secs: default_start_timeout_secs(),
      pull_fanout: default_pull_fanout(),
      pull_timeout_secs: default_pull_timeout_secs(),
      init_timeout_secs: default_init_timeout_secs(),
      stop_grace_secs: default_stop_grace_secs(),
      health_history_samples: default_health_history_samples(),
      progress_retention_secs: default_progress_retention_secs(),
      progress_queue_capacity: default_progress_queue_capacity(),
      allowed_volume_roots: Vec::new(),
      logging: Default::default(),
    }
  }
}
