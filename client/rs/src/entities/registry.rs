use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use super::I64;

/// Credentials for an image registry, selected per pull by
/// glob patterns over the image reference.
///
/// Pattern grammar: `*` matches one path segment (never `/`),
/// `**` matches one or more segments including `/`. Matching runs
/// against the reference with tag/digest stripped and the implicit
/// `docker.io/library/` prefix expanded.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryCredential {
  #[serde(default)]
  pub id: String,

  pub name: String,

  /// Registry endpoint, eg `ghcr.io`.
  #[serde(default)]
  pub url: String,

  #[serde(default)]
  pub username: Option<String>,

  /// Stored encrypted at rest; key management is external.
  #[serde(default)]
  pub secret: Option<String>,

  #[serde(default)]
  pub image_patterns: Vec<String>,

  /// Fallback when no pattern matches. At most one credential
  /// may be default.
  #[serde(default)]
  pub is_default: bool,

  #[serde(default)]
  pub created_at: I64,
}
