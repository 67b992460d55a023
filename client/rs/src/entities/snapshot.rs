use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use super::I64;

/// A rollback target captured before a mutating change.
/// At most one active `PreUpgrade` snapshot exists per deployment.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
  #[serde(default)]
  pub id: String,

  pub deployment_id: String,

  #[serde(default)]
  pub kind: SnapshotKind,

  #[serde(default)]
  pub captured_at: I64,

  /// The compose template as deployed, placeholders unrendered.
  #[serde(default)]
  pub compose_template: String,

  /// The variable values the template was rendered with.
  #[serde(default)]
  pub resolved_variables: HashMap<String, String>,

  /// image reference -> repo digest, read from the daemon for the
  /// containers running at capture time. Rollback pulls by digest.
  #[serde(default)]
  pub image_digests: HashMap<String, String>,

  /// The stack definition version current at capture time.
  #[serde(default)]
  pub target_version: String,

  #[serde(default)]
  pub description: Option<String>,
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
pub enum SnapshotKind {
  #[default]
  PreUpgrade,
  PreRollback,
}
