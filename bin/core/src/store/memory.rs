use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, Entry};

use super::KvStore;

/// In-memory [KvStore]. Namespaces map to inner maps lazily;
/// per-key atomicity comes from the dashmap entry API.
#[derive(Default)]
pub struct MemoryStore {
  namespaces: DashMap<String, Arc<DashMap<String, String>>>,
}

impl MemoryStore {
  pub fn new() -> MemoryStore {
    Default::default()
  }

  fn namespace(
    &self,
    namespace: &str,
  ) -> Arc<DashMap<String, String>> {
    self
      .namespaces
      .entry(namespace.to_string())
      .or_default()
      .clone()
  }
}

#[async_trait]
impl KvStore for MemoryStore {
  async fn get(
    &self,
    namespace: &str,
    key: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(
      self
        .namespaces
        .get(namespace)
        .and_then(|ns| ns.get(key).map(|v| v.clone())),
    )
  }

  async fn put(
    &self,
    namespace: &str,
    key: &str,
    value: String,
  ) -> anyhow::Result<()> {
    self.namespace(namespace).insert(key.to_string(), value);
    Ok(())
  }

  async fn delete(
    &self,
    namespace: &str,
    key: &str,
  ) -> anyhow::Result<()> {
    if let Some(ns) = self.namespaces.get(namespace) {
      ns.remove(key);
    }
    Ok(())
  }

  async fn list(
    &self,
    namespace: &str,
  ) -> anyhow::Result<Vec<String>> {
    let Some(ns) = self.namespaces.get(namespace) else {
      return Ok(Vec::new());
    };
    let mut entries = ns
      .iter()
      .map(|entry| (entry.key().clone(), entry.value().clone()))
      .collect::<Vec<_>>();
    // Stable output order regardless of shard layout.
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries.into_iter().map(|(_, v)| v).collect())
  }

  async fn compare_and_swap(
    &self,
    namespace: &str,
    key: &str,
    expected: Option<String>,
    value: String,
  ) -> anyhow::Result<bool> {
    let ns = self.namespace(namespace);
    match ns.entry(key.to_string()) {
      Entry::Occupied(mut entry) => {
        if expected.as_deref() == Some(entry.get().as_str()) {
          entry.insert(value);
          Ok(true)
        } else {
          Ok(false)
        }
      }
      Entry::Vacant(entry) => {
        if expected.is_none() {
          entry.insert(value);
          Ok(true)
        } else {
          Ok(false)
        }
      }
    }
  }
}
