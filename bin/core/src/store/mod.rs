use std::{marker::PhantomData, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use rsgo_client::entities::{
  deployment::{Deployment, ProductDeployment},
  environment::{Environment, EnvironmentVariables},
  health::HealthHistory,
  registry::RegistryCredential,
  snapshot::Snapshot,
  source::{Product, StackDefinition, StackSource},
};
use serde::{Serialize, de::DeserializeOwned};

mod memory;

pub use memory::MemoryStore;

/// The metadata store contract: namespaced key/value records with a
/// single-key compare-and-swap. Values are serialized JSON.
///
/// Durable backends are external; [MemoryStore] ships for tests and
/// single-node use.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
  async fn get(
    &self,
    namespace: &str,
    key: &str,
  ) -> anyhow::Result<Option<String>>;

  async fn put(
    &self,
    namespace: &str,
    key: &str,
    value: String,
  ) -> anyhow::Result<()>;

  async fn delete(
    &self,
    namespace: &str,
    key: &str,
  ) -> anyhow::Result<()>;

  async fn list(&self, namespace: &str)
  -> anyhow::Result<Vec<String>>;

  /// Write `value` only if the current value equals `expected`
  /// (`None` = key must not exist). Returns whether the swap won.
  async fn compare_and_swap(
    &self,
    namespace: &str,
    key: &str,
    expected: Option<String>,
    value: String,
  ) -> anyhow::Result<bool>;
}

pub mod namespaces {
  pub const ENVIRONMENTS: &str = "environments";
  pub const REGISTRY_CREDENTIALS: &str = "registry-credentials";
  pub const STACK_SOURCES: &str = "stack-sources";
  pub const STACK_DEFINITIONS: &str = "stack-definitions";
  pub const PRODUCTS: &str = "products";
  pub const DEPLOYMENTS: &str = "deployments";
  pub const PRODUCT_DEPLOYMENTS: &str = "product-deployments";
  pub const SNAPSHOTS: &str = "snapshots";
  pub const ENV_VARIABLES: &str = "env-variables";
  pub const HEALTH_HISTORY: &str = "health-history";
}

/// Typed view over one namespace.
pub struct Collection<T> {
  namespace: &'static str,
  kv: Arc<dyn KvStore>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
  fn clone(&self) -> Self {
    Collection {
      namespace: self.namespace,
      kv: self.kv.clone(),
      _marker: PhantomData,
    }
  }
}

impl<T: Serialize + DeserializeOwned> Collection<T> {
  fn new(
    namespace: &'static str,
    kv: Arc<dyn KvStore>,
  ) -> Collection<T> {
    Collection {
      namespace,
      kv,
      _marker: PhantomData,
    }
  }

  pub async fn get(&self, id: &str) -> anyhow::Result<Option<T>> {
    let Some(raw) = self.kv.get(self.namespace, id).await? else {
      return Ok(None);
    };
    let record = serde_json::from_str(&raw).with_context(|| {
      format!("corrupt record in {} at {id}", self.namespace)
    })?;
    Ok(Some(record))
  }

  pub async fn put(&self, id: &str, record: &T) -> anyhow::Result<()> {
    let raw = serde_json::to_string(record).with_context(|| {
      format!("failed to serialize record for {}", self.namespace)
    })?;
    self.kv.put(self.namespace, id, raw).await
  }

  pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
    self.kv.delete(self.namespace, id).await
  }

  pub async fn list(&self) -> anyhow::Result<Vec<T>> {
    let raws = self.kv.list(self.namespace).await?;
    let mut out = Vec::with_capacity(raws.len());
    for raw in raws {
      out.push(serde_json::from_str(&raw).with_context(|| {
        format!("corrupt record in {}", self.namespace)
      })?);
    }
    Ok(out)
  }

  /// Replace `expected` with `record` atomically.
  /// Returns false when another writer got there first.
  pub async fn compare_and_swap(
    &self,
    id: &str,
    expected: &T,
    record: &T,
  ) -> anyhow::Result<bool> {
    let expected = serde_json::to_string(expected)
      .context("failed to serialize expected record")?;
    let record = serde_json::to_string(record)
      .context("failed to serialize new record")?;
    self
      .kv
      .compare_and_swap(self.namespace, id, Some(expected), record)
      .await
  }

  /// Insert only if the key does not exist yet.
  pub async fn insert_new(
    &self,
    id: &str,
    record: &T,
  ) -> anyhow::Result<bool> {
    let record = serde_json::to_string(record)
      .context("failed to serialize new record")?;
    self
      .kv
      .compare_and_swap(self.namespace, id, None, record)
      .await
  }
}

/// Every namespace of the metadata store, typed.
pub struct Store {
  pub environments: Collection<Environment>,
  pub registry_credentials: Collection<RegistryCredential>,
  pub stack_sources: Collection<StackSource>,
  pub stack_definitions: Collection<StackDefinition>,
  pub products: Collection<Product>,
  pub deployments: Collection<Deployment>,
  pub product_deployments: Collection<ProductDeployment>,
  pub snapshots: Collection<Snapshot>,
  pub env_variables: Collection<EnvironmentVariables>,
  pub health_history: Collection<HealthHistory>,
}

impl Store {
  pub fn new(kv: Arc<dyn KvStore>) -> Store {
    use namespaces::*;
    Store {
      environments: Collection::new(ENVIRONMENTS, kv.clone()),
      registry_credentials: Collection::new(
        REGISTRY_CREDENTIALS,
        kv.clone(),
      ),
      stack_sources: Collection::new(STACK_SOURCES, kv.clone()),
      stack_definitions: Collection::new(
        STACK_DEFINITIONS,
        kv.clone(),
      ),
      products: Collection::new(PRODUCTS, kv.clone()),
      deployments: Collection::new(DEPLOYMENTS, kv.clone()),
      product_deployments: Collection::new(
        PRODUCT_DEPLOYMENTS,
        kv.clone(),
      ),
      snapshots: Collection::new(SNAPSHOTS, kv.clone()),
      env_variables: Collection::new(ENV_VARIABLES, kv.clone()),
      health_history: Collection::new(HEALTH_HISTORY, kv),
    }
  }
}
