use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rsgo_client::entities::environment::Environment;

mod client;

pub use client::{BollardConnector, DockerClient};

/// The slice of the daemon API the core relies on, behind one
/// narrow contract so operations and the monitor can be driven
/// against test doubles.
#[async_trait]
pub trait DockerApi: Send + Sync + 'static {
  async fn ping(&self) -> anyhow::Result<()>;

  /// All containers (running or not) matching every given
  /// `label=value` pair.
  async fn list_containers(
    &self,
    label_filters: &[(String, String)],
  ) -> anyhow::Result<Vec<ContainerSummary>>;

  async fn inspect_container(
    &self,
    name_or_id: &str,
  ) -> anyhow::Result<ContainerDetails>;

  async fn create_container(
    &self,
    spec: ContainerSpec,
  ) -> anyhow::Result<String>;

  async fn start_container(&self, name: &str) -> anyhow::Result<()>;

  async fn stop_container(
    &self,
    name: &str,
    grace_secs: u64,
  ) -> anyhow::Result<()>;

  async fn kill_container(&self, name: &str) -> anyhow::Result<()>;

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
  ) -> anyhow::Result<()>;

  /// Block until the container exits, returning its exit code.
  async fn wait_container(&self, name: &str)
  -> anyhow::Result<i64>;

  /// Follow the container's output line by line until it exits.
  async fn follow_logs(
    &self,
    name: &str,
  ) -> anyhow::Result<BoxStream<'static, String>>;

  async fn pull_image(
    &self,
    image: &str,
    auth: Option<RegistryAuth>,
  ) -> anyhow::Result<()>;

  /// The repo digest of a locally present image, if any.
  async fn image_digest(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>>;

  async fn create_network(
    &self,
    name: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()>;

  async fn remove_network(&self, name: &str) -> anyhow::Result<()>;

  async fn list_networks(
    &self,
    label_filters: &[(String, String)],
  ) -> anyhow::Result<Vec<String>>;

  async fn create_volume(
    &self,
    name: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()>;

  async fn remove_volume(&self, name: &str) -> anyhow::Result<()>;

  async fn list_volumes(
    &self,
    label_filters: &[(String, String)],
  ) -> anyhow::Result<Vec<String>>;
}

/// Hands out (and caches) one [DockerApi] handle per environment.
/// Swapped for a scripted connector in tests.
#[async_trait]
pub trait DockerConnector: Send + Sync + 'static {
  async fn connect(
    &self,
    environment: &Environment,
  ) -> anyhow::Result<Arc<dyn DockerApi>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSummary {
  pub id: String,
  pub name: String,
  pub image: String,
  pub state: ContainerRunState,
  pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerRunState {
  Created,
  Running,
  Paused,
  Restarting,
  Exited,
  Removing,
  Dead,
  #[default]
  Unknown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDetails {
  pub id: String,
  pub name: String,
  pub image: String,
  pub running: bool,
  pub restarting: bool,
  pub exit_code: Option<i64>,
  pub restart_count: u64,
  /// None when the container has no healthcheck.
  pub health: Option<ContainerHealthKind>,
  pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerHealthKind {
  Starting,
  Healthy,
  Unhealthy,
}

/// Everything the engine needs to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
  pub name: String,
  pub image: String,
  /// `KEY=value` pairs.
  pub env: Vec<String>,
  pub labels: HashMap<String, String>,
  pub ports: Vec<PortSpec>,
  /// Docker restart policy name, eg `no` / `unless-stopped`.
  pub restart: String,
  pub healthcheck: Option<HealthcheckSpec>,
  /// Network to attach, created per stack by the engine.
  pub network: Option<String>,
  /// Bind specs `source:target[:opts]`, sources already validated
  /// by the planner. Named volumes use the volume name as source.
  pub binds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
  pub host: u16,
  pub container: u16,
  /// `tcp` / `udp`.
  pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthcheckSpec {
  /// Raw test command, eg `["CMD-SHELL", "curl -f localhost"]`.
  pub test: Vec<String>,
  pub interval_secs: Option<u64>,
  pub timeout_secs: Option<u64>,
  pub retries: Option<u64>,
  pub start_period_secs: Option<u64>,
}

/// Per-pull auth constructed from the resolved credential.
/// Sent base64 encoded in the X-Registry-Auth header.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
  pub username: String,
  pub password: String,
  pub server_address: String,
}

/// Bounded exponential retry for transient daemon errors:
/// 500ms base, doubling with jitter, 3 attempts, capped at 8s.
pub async fn with_retries<T, F, Fut>(
  label: &str,
  mut call: F,
) -> anyhow::Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = anyhow::Result<T>>,
{
  const MAX_ATTEMPTS: u32 = 3;
  const CAP: Duration = Duration::from_secs(8);
  let mut delay = Duration::from_millis(500);
  let mut attempt = 1;
  loop {
    match call().await {
      Ok(res) => return Ok(res),
      Err(e) if attempt >= MAX_ATTEMPTS => return Err(e),
      Err(e) => {
        warn!(
          "{label} failed (attempt {attempt}/{MAX_ATTEMPTS}), retrying | {e:#}"
        );
        let jitter = Duration::from_millis(
          rand::random_range(0..=delay.as_millis() as u64 / 4),
        );
        tokio::time::sleep((delay + jitter).min(CAP)).await;
        delay = (delay * 2).min(CAP);
        attempt += 1;
      }
    }
  }
}
