use derive_empty_traits::EmptyTraits;
use resolver_api::Resolve;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::entities::{
  deployment::Deployment,
  health::{HealthState, HealthSummary},
  snapshot::Snapshot,
};

use super::RsgoReadRequest;

/// Current health for one deployment. Response: [StackHealthDto]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoReadRequest)]
#[response(StackHealthDto)]
#[error(serror::Error)]
pub struct GetStackHealth {
  pub environment: String,
  pub deployment: String,
  /// Run a reconcile now instead of serving the cached sample.
  #[serde(default)]
  pub force_refresh: bool,
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackHealthDto {
  pub state: HealthState,
  pub summary: HealthSummary,
}

/// Response: [Deployment]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoReadRequest)]
#[response(Deployment)]
#[error(serror::Error)]
pub struct GetDeployment {
  /// Deployment id.
  pub deployment: String,
}

/// Response: [ListDeploymentsResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoReadRequest)]
#[response(ListDeploymentsResponse)]
#[error(serror::Error)]
pub struct ListDeployments {
  /// Restrict to one environment. Empty lists all.
  #[serde(default)]
  pub environment: String,
}

#[typeshare]
pub type ListDeploymentsResponse = Vec<Deployment>;

/// Snapshots retained for a deployment, newest first.
/// Response: [ListSnapshotsResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoReadRequest)]
#[response(ListSnapshotsResponse)]
#[error(serror::Error)]
pub struct ListSnapshots {
  pub deployment: String,
}

#[typeshare]
pub type ListSnapshotsResponse = Vec<Snapshot>;

/// Whether a deployment is eligible for
/// [RollbackStack][crate::api::execute::RollbackStack].
/// Response: [CanRollbackResponse]
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Serialize, Deserialize, Resolve,
  EmptyTraits,
)]
#[empty_traits(RsgoReadRequest)]
#[response(CanRollbackResponse)]
#[error(serror::Error)]
pub struct CanRollback {
  pub deployment: String,
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanRollbackResponse {
  pub eligible: bool,
}
