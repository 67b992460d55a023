//! Serde model for the subset of the compose format the planner
//! consumes, tolerant of the usual map-or-list shorthands.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::docker::HealthcheckSpec;

#[derive(Debug, Default, Deserialize)]
pub struct ComposeFile {
  #[serde(default)]
  pub services: IndexMap<String, ComposeService>,
  /// Top level named volume declarations. Bodies are opaque.
  #[serde(default)]
  pub volumes: IndexMap<String, serde_yaml_ng::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComposeService {
  #[serde(default)]
  pub image: Option<String>,
  #[serde(default)]
  pub environment: KeyValues,
  #[serde(default)]
  pub ports: Entries,
  #[serde(default)]
  pub depends_on: DependsOn,
  #[serde(default)]
  pub healthcheck: Option<ComposeHealthcheck>,
  #[serde(default)]
  pub labels: KeyValues,
  #[serde(default)]
  pub restart: Option<String>,
  #[serde(default)]
  pub volumes: Entries,
}

/// `- KEY=value` list form or `KEY: value` map form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum KeyValues {
  List(Vec<String>),
  Map(IndexMap<String, YamlScalar>),
}

impl Default for KeyValues {
  fn default() -> Self {
    KeyValues::List(Vec::new())
  }
}

impl KeyValues {
  /// `KEY=value` pairs in declaration order.
  pub fn entries(&self) -> Vec<String> {
    match self {
      KeyValues::List(list) => list.clone(),
      KeyValues::Map(map) => map
        .iter()
        .map(|(key, value)| format!("{key}={}", value.as_str()))
        .collect(),
    }
  }

  pub fn map(&self) -> HashMap<String, String> {
    match self {
      KeyValues::List(list) => list
        .iter()
        .map(|entry| match entry.split_once('=') {
          Some((key, value)) => {
            (key.to_string(), value.to_string())
          }
          None => (entry.clone(), String::new()),
        })
        .collect(),
      KeyValues::Map(map) => map
        .iter()
        .map(|(key, value)| (key.clone(), value.as_str()))
        .collect(),
    }
  }
}

/// Plain string lists (ports, volume specs); scalars are
/// stringified so `8080:80` survives yaml's number parsing.
#[derive(Debug, Default, Deserialize)]
pub struct Entries(Vec<YamlScalar>);

impl Entries {
  pub fn entries(&self) -> Vec<String> {
    self.0.iter().map(|scalar| scalar.as_str()).collect()
  }
}

/// `depends_on` list form or `service: {condition: ...}` map form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
  List(Vec<String>),
  Map(IndexMap<String, serde_yaml_ng::Value>),
}

impl Default for DependsOn {
  fn default() -> Self {
    DependsOn::List(Vec::new())
  }
}

impl DependsOn {
  pub fn services(&self) -> Vec<String> {
    match self {
      DependsOn::List(list) => list.clone(),
      DependsOn::Map(map) => map.keys().cloned().collect(),
    }
  }
}

#[derive(Debug, Default, Deserialize)]
pub struct ComposeHealthcheck {
  #[serde(default)]
  pub test: HealthTest,
  #[serde(default)]
  pub interval: Option<String>,
  #[serde(default)]
  pub timeout: Option<String>,
  #[serde(default)]
  pub retries: Option<u64>,
  #[serde(default)]
  pub start_period: Option<String>,
  #[serde(default)]
  pub disable: bool,
}

impl ComposeHealthcheck {
  pub fn to_spec(&self) -> Option<HealthcheckSpec> {
    if self.disable {
      return None;
    }
    let test = match &self.test {
      HealthTest::None => return None,
      // String form runs through the shell.
      HealthTest::Command(command) => {
        vec![String::from("CMD-SHELL"), command.clone()]
      }
      HealthTest::Argv(argv) => {
        if argv.first().map(String::as_str) == Some("NONE") {
          return None;
        }
        argv.clone()
      }
    };
    Some(HealthcheckSpec {
      test,
      interval_secs: self.interval.as_deref().and_then(parse_duration),
      timeout_secs: self.timeout.as_deref().and_then(parse_duration),
      retries: self.retries,
      start_period_secs: self
        .start_period
        .as_deref()
        .and_then(parse_duration),
    })
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
pub enum HealthTest {
  #[default]
  None,
  Command(String),
  Argv(Vec<String>),
}

/// Compose duration shorthand: `90s`, `2m`, `1h`, `1m30s`,
/// or a bare number of seconds.
fn parse_duration(value: &str) -> Option<u64> {
  let value = value.trim();
  if value.is_empty() {
    return None;
  }
  if let Ok(secs) = value.parse::<u64>() {
    return Some(secs);
  }
  let mut total = 0u64;
  let mut number = String::new();
  for c in value.chars() {
    if c.is_ascii_digit() {
      number.push(c);
      continue;
    }
    let quantity = number.parse::<u64>().ok()?;
    number.clear();
    total += match c {
      'h' => quantity * 3600,
      'm' => quantity * 60,
      's' => quantity,
      // Sub-second precision rounds down to whole seconds.
      _ => return None,
    };
  }
  if !number.is_empty() {
    return None;
  }
  Some(total)
}

/// A yaml scalar read back as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum YamlScalar {
  String(String),
  Int(i64),
  Float(f64),
  Bool(bool),
  Null,
}

impl YamlScalar {
  pub fn as_str(&self) -> String {
    match self {
      YamlScalar::String(s) => s.clone(),
      YamlScalar::Int(i) => i.to_string(),
      YamlScalar::Float(f) => f.to_string(),
      YamlScalar::Bool(b) => b.to_string(),
      YamlScalar::Null => String::new(),
    }
  }
}
