use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use super::I64;

/// One reconciled health sample for a deployment.
/// History is kept as a bounded ring of these.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
  pub deployment_id: String,

  #[serde(default)]
  pub overall_status: StackHealthStatus,

  #[serde(default)]
  pub operation_mode: OperationMode,

  #[serde(default)]
  pub services: Vec<ServiceHealth>,

  #[serde(default)]
  pub captured_at_utc: I64,

  /// Unhealthy or degraded outside of an operation or
  /// maintenance window.
  #[serde(default)]
  pub requires_attention: bool,
}

impl HealthState {
  pub fn healthy_count(&self) -> usize {
    self
      .services
      .iter()
      .filter(|s| s.status == ServiceHealthStatus::Healthy)
      .count()
  }

  /// Condensed form published on the environment topic.
  pub fn summarize(&self, environment_id: &str) -> HealthSummary {
    let healthy = self.healthy_count();
    let total = self.services.len();
    HealthSummary {
      deployment_id: self.deployment_id.clone(),
      environment_id: environment_id.to_string(),
      overall_status: self.overall_status,
      healthy: healthy as u64,
      total: total as u64,
      message: format!("{healthy}/{total} services healthy"),
      captured_at_utc: self.captured_at_utc,
    }
  }

  /// Whether a change event should fire against the prior sample.
  /// Timestamps alone never trigger one.
  pub fn differs_from(&self, other: &HealthState) -> bool {
    self.overall_status != other.overall_status
      || self.operation_mode != other.operation_mode
      || self.requires_attention != other.requires_attention
      || self.services != other.services
  }
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
pub enum StackHealthStatus {
  Healthy,
  Degraded,
  Unhealthy,
  #[default]
  Unknown,
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
pub enum OperationMode {
  #[default]
  Normal,
  Maintenance,
  Upgrading,
  RollingBack,
}

impl OperationMode {
  /// Modes during which degraded health is expected and
  /// does not require attention.
  pub fn suppresses_attention(&self) -> bool {
    !matches!(self, OperationMode::Normal)
  }
}

#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
  pub service_name: String,

  #[serde(default)]
  pub status: ServiceHealthStatus,

  #[serde(default)]
  pub container_id: Option<String>,

  #[serde(default)]
  pub container_name: Option<String>,

  #[serde(default)]
  pub restart_count: u64,

  #[serde(default)]
  pub reason: Option<String>,
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
pub enum ServiceHealthStatus {
  Healthy,
  Starting,
  Unhealthy,
  #[default]
  Unknown,
}

/// Bounded ring of health samples per deployment, oldest first.
/// Keyed by the deployment id in the store.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthHistory {
  pub deployment_id: String,
  #[serde(default)]
  pub samples: Vec<HealthState>,
}

impl HealthHistory {
  /// Append a sample, dropping the oldest past `capacity`.
  pub fn push(&mut self, sample: HealthState, capacity: usize) {
    self.samples.push(sample);
    if self.samples.len() > capacity {
      let excess = self.samples.len() - capacity;
      self.samples.drain(..excess);
    }
  }
}

/// Published on the `env:<id>` topic whenever a deployment's
/// health sample changes.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
  pub deployment_id: String,
  pub environment_id: String,
  #[serde(default)]
  pub overall_status: StackHealthStatus,
  #[serde(default)]
  pub healthy: u64,
  #[serde(default)]
  pub total: u64,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub captured_at_utc: I64,
}
