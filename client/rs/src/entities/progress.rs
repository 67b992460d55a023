use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use super::I64;

/// Structured progress for one operation session.
///
/// Per session, `percent_complete` never decreases, and exactly
/// one terminal event (`is_complete = true`) ends the stream.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
  pub session_id: String,

  #[serde(default)]
  pub phase: ProgressPhase,

  #[serde(default)]
  pub message: String,

  /// 0..=100.
  #[serde(default)]
  pub percent_complete: u8,

  #[serde(default)]
  pub current_service: Option<String>,

  #[serde(default)]
  pub total_services: u64,

  #[serde(default)]
  pub completed_services: u64,

  #[serde(default)]
  pub total_init_containers: u64,

  #[serde(default)]
  pub completed_init_containers: u64,

  #[serde(default)]
  pub is_complete: bool,

  #[serde(default)]
  pub is_error: bool,

  #[serde(default)]
  pub error_message: Option<String>,
}

/// Operation phases, each owning a fixed percent band.
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
pub enum ProgressPhase {
  #[default]
  Preparing,
  PullingImages,
  InitializingContainers,
  StartingServices,
  ProductDeploy,
  ProductRemoval,
  Finalizing,
}

impl ProgressPhase {
  /// The `(low, high)` percent band the phase occupies within a
  /// single stack operation. Product phases span the whole range;
  /// the orchestrator compresses inner bands itself.
  pub fn band(&self) -> (u8, u8) {
    match self {
      ProgressPhase::Preparing => (0, 5),
      ProgressPhase::PullingImages => (5, 40),
      ProgressPhase::InitializingContainers => (40, 65),
      ProgressPhase::StartingServices => (65, 95),
      ProgressPhase::Finalizing => (95, 100),
      ProgressPhase::ProductDeploy
      | ProgressPhase::ProductRemoval => (0, 100),
    }
  }

  /// Percent at `completed` of `total` units into this band.
  pub fn percent_at(&self, completed: u64, total: u64) -> u8 {
    let (low, high) = self.band();
    if total == 0 {
      return low;
    }
    let span = (high - low) as u64;
    let offset = (span * completed.min(total)) / total;
    low + offset as u8
  }
}

/// One line of init container output, relayed on the session.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  pub session_id: String,
  #[serde(default)]
  pub container_name: String,
  #[serde(default)]
  pub log_line: String,
  #[serde(default)]
  pub ts: I64,
}
