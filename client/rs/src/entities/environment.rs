use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use super::I64;

/// One managed Docker daemon.
/// Owns Deployments, ProductDeployments and health state.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
  #[serde(default)]
  pub id: String,

  /// Display name, unique across environments.
  pub name: String,

  /// Unix socket path (`unix:///var/run/docker.sock`) or
  /// TCP endpoint (`tcp://10.0.0.5:2375`) of the daemon.
  /// Empty means the platform default socket.
  #[serde(default)]
  pub address: String,

  #[serde(default)]
  pub created_at: I64,
}

impl Environment {
  /// Whether the environment points at the local default socket.
  pub fn is_local_default(&self) -> bool {
    self.address.is_empty()
  }
}

/// Variable values persisted per environment across deployments.
/// Keyed by the environment id in the store.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariables {
  pub environment_id: String,
  #[serde(default)]
  pub variables: std::collections::HashMap<String, String>,
}
