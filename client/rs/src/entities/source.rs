use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use super::I64;

/// A location stack definitions are discovered from.
/// Sync replaces the owned [StackDefinition] set wholesale.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSource {
  #[serde(default)]
  pub id: String,

  pub name: String,

  #[serde(default)]
  pub kind: StackSourceKind,

  /// Local directory path or git clone url, depending on kind.
  /// Unused for the curated catalog.
  #[serde(default)]
  pub location: String,

  /// Branch for git sources.
  #[serde(default)]
  pub branch: String,

  /// Glob filter applied to discovered compose files,
  /// eg `**/compose.yaml`.
  #[serde(default)]
  pub file_pattern: String,

  #[serde(default = "default_enabled")]
  pub enabled: bool,

  #[serde(default)]
  pub last_synced_at: I64,
}

fn default_enabled() -> bool {
  true
}

impl Default for StackSource {
  fn default() -> Self {
    Self {
      id: String::new(),
      name: String::new(),
      kind: Default::default(),
      location: String::new(),
      branch: String::new(),
      file_pattern: String::new(),
      enabled: default_enabled(),
      last_synced_at: 0,
    }
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
pub enum StackSourceKind {
  #[default]
  LocalDir,
  GitRepo,
  Catalog,
}

/// A versioned compose template published by a source sync.
/// Immutable once published; the next sync replaces it.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackDefinition {
  #[serde(default)]
  pub id: String,

  pub source_id: String,

  /// The product this definition belongs to, if any.
  #[serde(default)]
  pub product_id: String,

  pub name: String,

  pub version: String,

  /// Raw compose yaml with `${VAR}` placeholders.
  pub compose_template: String,

  /// Variables the template accepts.
  #[serde(default)]
  pub variables: Vec<VariableSpec>,

  /// Main service names, in template order.
  #[serde(default)]
  pub services: Vec<String>,

  /// Init container service names, in run order.
  #[serde(default)]
  pub init_containers: Vec<String>,
}

impl StackDefinition {
  /// Default variable values declared on the definition.
  pub fn default_values(&self) -> HashMap<String, String> {
    self
      .variables
      .iter()
      .filter_map(|v| {
        v.default_value.clone().map(|d| (v.name.clone(), d))
      })
      .collect()
  }
}

#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableSpec {
  pub name: String,

  /// Human label shown by configuration UIs.
  #[serde(default)]
  pub label: Option<String>,

  /// Grouping key for configuration UIs.
  #[serde(default)]
  pub group: Option<String>,

  #[serde(default)]
  pub is_required: bool,

  #[serde(default)]
  pub default_value: Option<String>,

  #[serde(default)]
  pub kind: VariableKind,
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VariableKind {
  #[default]
  Text,
  Secret,
  Enum,
  Bool,
  Number,
}

/// A bundle of stack definitions sharing identity, version
/// and (typically) variables.
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
  #[serde(default)]
  pub id: String,

  pub name: String,

  pub version: String,

  /// StackDefinition ids, in deploy order.
  /// Removal runs in reverse.
  #[serde(default)]
  pub stacks: Vec<String>,
}

impl Product {
  /// A variable is shared iff its name appears in the variable
  /// set of at least two of the product's stack definitions.
  pub fn shared_variable_names(
    definitions: &[StackDefinition],
  ) -> Vec<String> {
    let mut counts = HashMap::<&str, usize>::new();
    for def in definitions {
      for var in &def.variables {
        *counts.entry(var.name.as_str()).or_default() += 1;
      }
    }
    let mut shared = counts
      .into_iter()
      .filter(|(_, count)| *count >= 2)
      .map(|(name, _)| name.to_string())
      .collect::<Vec<_>>();
    shared.sort();
    shared
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn definition(name: &str, variables: &[&str]) -> StackDefinition {
    StackDefinition {
      name: name.to_string(),
      variables: variables
        .iter()
        .map(|v| VariableSpec {
          name: v.to_string(),
          ..Default::default()
        })
        .collect(),
      ..Default::default()
    }
  }

  #[test]
  fn variables_in_two_or_more_stacks_are_shared() {
    let definitions = vec![
      definition("a", &["DB_HOST", "API_KEY", "A_ONLY"]),
      definition("b", &["DB_HOST", "B_ONLY"]),
      definition("c", &["API_KEY"]),
    ];
    assert_eq!(
      Product::shared_variable_names(&definitions),
      vec!["API_KEY", "DB_HOST"]
    );
  }

  #[test]
  fn single_stack_products_share_nothing() {
    let definitions = vec![definition("a", &["X", "Y"])];
    assert!(
      Product::shared_variable_names(&definitions).is_empty()
    );
  }
}
