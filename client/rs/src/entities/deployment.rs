use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use super::I64;

/// An installed instance of a [StackDefinition][super::source::StackDefinition]
/// in an [Environment][super::environment::Environment].
///
/// `(environment_id, stack_name)` is unique.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deployment {
  #[serde(default)]
  pub id: String,

  pub environment_id: String,

  pub stack_definition_id: String,

  /// User-chosen name, unique per environment.
  pub stack_name: String,

  #[serde(default)]
  pub status: DeploymentStatus,

  #[serde(default)]
  pub current_version: String,

  #[serde(default)]
  pub deployed_at: I64,

  /// Resolved variable values. Secret-kind values are masked
  /// before this record is persisted or returned.
  #[serde(default)]
  pub configuration: HashMap<String, String>,

  /// One entry per main service, refreshed by deploys and
  /// kept current by the health monitor within one reconcile.
  #[serde(default)]
  pub services: Vec<ServiceInstance>,

  /// Outcomes of the most recent init container run.
  #[serde(default)]
  pub init_container_results: Vec<InitContainerResult>,

  #[serde(default)]
  pub upgrade_count: u64,

  /// The last mutating operation attempted on this deployment.
  #[serde(default)]
  pub last_operation: Option<OperationKind>,

  #[serde(default)]
  pub last_failure_reason: Option<String>,

  /// User-toggled maintenance mode. Suppresses requires_attention
  /// without stopping reconciliation.
  #[serde(default)]
  pub maintenance: bool,

  /// Set when this deployment was installed through a product.
  #[serde(default)]
  pub product_deployment_id: Option<String>,
}

impl Deployment {
  /// Whether a mutating operation is recorded as in flight.
  /// After a crash this is what recovery sweeps back to Failed.
  pub fn in_flight(&self) -> bool {
    matches!(
      self.status,
      DeploymentStatus::Installing
        | DeploymentStatus::Upgrading
        | DeploymentStatus::RollingBack
        | DeploymentStatus::Removing
    )
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
pub enum DeploymentStatus {
  #[default]
  Installing,
  Running,
  Upgrading,
  Failed,
  RollingBack,
  Removing,
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
pub enum OperationKind {
  Install,
  Upgrade,
  Rollback,
  Remove,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceInstance {
  pub service_name: String,

  /// Container id on the daemon, refreshed each reconcile.
  #[serde(default)]
  pub container_id: Option<String>,

  /// The image the container was created from.
  /// Drives the upgrade recreate diff.
  #[serde(default)]
  pub image: String,

  /// `host:container` port bindings.
  #[serde(default)]
  pub ports: Vec<String>,
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitContainerResult {
  pub service_name: String,

  #[serde(default)]
  pub exit_code: i64,

  #[serde(default)]
  pub success: bool,

  /// Captured log lines, bounded by the runner.
  #[serde(default)]
  pub logs: Vec<String>,
}

/// Groups the deployments installed together for a product.
/// All referenced deployments live in the same environment.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductDeployment {
  #[serde(default)]
  pub id: String,

  pub environment_id: String,

  pub product_id: String,

  #[serde(default)]
  pub product_version: String,

  /// Deployment ids, in the product's declared stack order.
  #[serde(default)]
  pub stacks: Vec<String>,

  #[serde(default)]
  pub status: ProductDeploymentStatus,

  /// Values applied to every stack that declares the variable.
  /// Per-stack values override these.
  #[serde(default)]
  pub shared_variables: HashMap<String, String>,
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
pub enum ProductDeploymentStatus {
  #[default]
  Deploying,
  Deployed,
  /// At least one stack failed while others succeeded.
  Partial,
  Failed,
  Removing,
}
