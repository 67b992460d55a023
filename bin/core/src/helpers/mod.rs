pub mod action_state;

use rsgo_client::entities::{
  SECRET_MASK,
  source::{StackDefinition, VariableKind},
};
use std::collections::HashMap;

/// Names of secret-kind variables declared on a definition.
pub fn secret_variable_names(
  definition: &StackDefinition,
) -> Vec<&str> {
  definition
    .variables
    .iter()
    .filter(|v| v.kind == VariableKind::Secret)
    .map(|v| v.name.as_str())
    .collect()
}

/// Copy of the resolved variables with secret values masked,
/// safe to persist and return from the API.
pub fn masked_configuration(
  definition: &StackDefinition,
  resolved: &HashMap<String, String>,
) -> HashMap<String, String> {
  let secrets = secret_variable_names(definition);
  resolved
    .iter()
    .map(|(name, value)| {
      let value = if secrets.contains(&name.as_str()) {
        SECRET_MASK.to_string()
      } else {
        value.clone()
      };
      (name.clone(), value)
    })
    .collect()
}
