use std::collections::HashMap;

use derive_empty_traits::EmptyTraits;
use resolver_api::Resolve;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::entities::{
  NoData, deployment::ProductDeploymentStatus,
};

use super::RsgoExecuteRequest;

/// Install a stack definition into an environment.
/// Response: [DeployStackResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(DeployStackResponse)]
#[error(serror::Error)]
pub struct DeployStack {
  /// Environment id.
  pub environment: String,
  /// StackDefinition id.
  pub stack_definition: String,
  /// User-chosen stack name, unique per environment.
  pub stack_name: String,
  /// Variable values supplied by the caller.
  #[serde(default)]
  pub variables: HashMap<String, String>,
  /// Correlation id for the progress stream.
  /// Generated when empty.
  #[serde(default)]
  pub session_id: String,
  /// Idempotency key. Repeat calls with the same key while the
  /// operation is in flight return the existing session.
  #[serde(default)]
  pub attempt_id: String,
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployStackResponse {
  pub deployment_id: String,
  pub session_id: String,
}

/// Upgrade a running deployment to a new stack definition.
/// Captures a pre-upgrade snapshot first.
/// Response: [StackOpResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(StackOpResponse)]
#[error(serror::Error)]
pub struct UpgradeStack {
  pub environment: String,
  /// Deployment id.
  pub deployment: String,
  /// The new StackDefinition id.
  pub stack_definition: String,
  #[serde(default)]
  pub variables: HashMap<String, String>,
  #[serde(default)]
  pub session_id: String,
  #[serde(default)]
  pub attempt_id: String,
}

/// Roll a failed upgrade back to its pre-upgrade snapshot.
/// Images are pulled by recorded digest. Response: [StackOpResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(StackOpResponse)]
#[error(serror::Error)]
pub struct RollbackStack {
  pub environment: String,
  pub deployment: String,
  #[serde(default)]
  pub session_id: String,
  #[serde(default)]
  pub attempt_id: String,
}

/// Stop and remove a deployment's containers (reverse dependency
/// order) along with stack-owned networks and volumes.
/// Response: [StackOpResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(StackOpResponse)]
#[error(serror::Error)]
pub struct RemoveStack {
  pub environment: String,
  pub deployment: String,
  #[serde(default)]
  pub session_id: String,
  #[serde(default)]
  pub attempt_id: String,
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackOpResponse {
  pub session_id: String,
}

/// Force a deployment stuck in `Installing` / `Upgrading` into
/// `Failed`, eg after its operation process was killed.
/// Response: [NoData]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(NoData)]
#[error(serror::Error)]
pub struct MarkAsFailed {
  pub environment: String,
  pub deployment: String,
  pub reason: String,
}

/// Per-stack inputs for a product operation.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductStackConfig {
  pub stack_definition_id: String,
  pub stack_name: String,
  #[serde(default)]
  pub variables: HashMap<String, String>,
}

/// Deploy every stack of a product sequentially in declared order.
/// Response: [ProductOpResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(ProductOpResponse)]
#[error(serror::Error)]
pub struct DeployProduct {
  pub environment: String,
  /// Product id.
  pub product: String,
  #[serde(default)]
  pub stack_configs: Vec<ProductStackConfig>,
  /// Values applied to every stack declaring the variable.
  #[serde(default)]
  pub shared_variables: HashMap<String, String>,
  /// Keep deploying remaining stacks after one fails.
  #[serde(default)]
  pub continue_on_error: bool,
  #[serde(default)]
  pub session_id: String,
}

/// Upgrade the stacks of an installed product in declared order.
/// Response: [ProductOpResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(ProductOpResponse)]
#[error(serror::Error)]
pub struct UpgradeProduct {
  pub environment: String,
  /// ProductDeployment id.
  pub product_deployment: String,
  /// The new Product id (may equal the installed one).
  pub product: String,
  #[serde(default)]
  pub stack_configs: Vec<ProductStackConfig>,
  #[serde(default)]
  pub shared_variables: HashMap<String, String>,
  #[serde(default)]
  pub continue_on_error: bool,
  #[serde(default)]
  pub session_id: String,
}

/// Remove an installed product, stacks in reverse declared order.
/// Response: [ProductOpResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(ProductOpResponse)]
#[error(serror::Error)]
pub struct RemoveProduct {
  pub environment: String,
  pub product_deployment: String,
  #[serde(default)]
  pub continue_on_error: bool,
  #[serde(default)]
  pub session_id: String,
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductOpResponse {
  pub product_deployment_id: String,
  pub session_id: String,
  pub status: ProductDeploymentStatus,
  pub results: Vec<ProductStackResult>,
}

#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductStackResult {
  pub stack_name: String,
  #[serde(default)]
  pub deployment_id: Option<String>,
  pub success: bool,
  #[serde(default)]
  pub error: Option<String>,
}

/// Suppress `requires_attention` for a deployment without
/// stopping reconciliation. Response: [NoData]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(NoData)]
#[error(serror::Error)]
pub struct EnterMaintenance {
  pub environment: String,
  pub deployment: String,
}

/// Response: [NoData]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoExecuteRequest)]
#[response(NoData)]
#[error(serror::Error)]
pub struct ExitMaintenance {
  pub environment: String,
  pub deployment: String,
}
