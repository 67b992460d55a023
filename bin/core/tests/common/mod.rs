//! Shared harness: an in-memory store and a scripted daemon
//! standing in for Docker, wired into a real `Core`.
#![allow(dead_code)]

use std::{
  collections::{HashMap, HashSet},
  sync::{Arc, Mutex},
  time::Duration,
};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use rsgo_client::entities::{
  config::CoreConfig,
  environment::Environment,
  new_id,
  progress::ProgressEvent,
  source::{StackDefinition, VariableSpec},
};
use rsgo_core::{
  docker::{
    ContainerDetails, ContainerHealthKind, ContainerRunState,
    ContainerSpec, ContainerSummary, DockerApi, DockerConnector,
    RegistryAuth,
  },
  progress::{BusEvent, ProgressReceiver},
  state::Core,
  store::MemoryStore,
};

#[derive(Clone, Debug)]
pub struct FakeContainer {
  pub id: String,
  pub image: String,
  pub running: bool,
  pub exit_code: Option<i64>,
  pub restart_count: u64,
  pub has_healthcheck: bool,
  pub labels: HashMap<String, String>,
}

/// One scripted daemon. Configure failure modes up front, then
/// let operations run against it.
#[derive(Default)]
pub struct FakeDocker {
  pub containers: Mutex<HashMap<String, FakeContainer>>,
  pub networks: Mutex<HashMap<String, HashMap<String, String>>>,
  pub volumes: Mutex<HashMap<String, HashMap<String, String>>>,
  /// Every image reference passed to pull, in order.
  pub pulled: Mutex<Vec<String>>,
  /// Image references whose pull fails.
  pub fail_pulls: Mutex<HashSet<String>>,
  /// Container names whose removal fails.
  pub fail_removes: Mutex<HashSet<String>>,
  /// Exit codes by container name (init containers).
  pub exit_codes: Mutex<HashMap<String, i64>>,
  /// Log lines replayed for a container name.
  pub log_lines: Mutex<HashMap<String, Vec<String>>>,
  /// Healthcheck verdicts by container name.
  pub health_overrides:
    Mutex<HashMap<String, ContainerHealthKind>>,
  /// image -> repo digest.
  pub digests: Mutex<HashMap<String, String>>,
  /// When set, every daemon call errors (dead daemon).
  pub dead: Mutex<bool>,
}

impl FakeDocker {
  pub fn container(&self, name: &str) -> Option<FakeContainer> {
    self.containers.lock().unwrap().get(name).cloned()
  }

  pub fn container_names(&self) -> Vec<String> {
    let mut names = self
      .containers
      .lock()
      .unwrap()
      .keys()
      .cloned()
      .collect::<Vec<_>>();
    names.sort();
    names
  }

  fn check_alive(&self) -> anyhow::Result<()> {
    if *self.dead.lock().unwrap() {
      anyhow::bail!("daemon not reachable");
    }
    Ok(())
  }

  fn matches(
    labels: &HashMap<String, String>,
    filters: &[(String, String)],
  ) -> bool {
    filters
      .iter()
      .all(|(key, value)| labels.get(key) == Some(value))
  }
}

#[async_trait]
impl DockerApi for FakeDocker {
  async fn ping(&self) -> anyhow::Result<()> {
    self.check_alive()
  }

  async fn list_containers(
    &self,
    filters: &[(String, String)],
  ) -> anyhow::Result<Vec<ContainerSummary>> {
    self.check_alive()?;
    Ok(
      self
        .containers
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, c)| Self::matches(&c.labels, filters))
        .map(|(name, c)| ContainerSummary {
          id: c.id.clone(),
          name: name.clone(),
          image: c.image.clone(),
          state: if c.running {
            ContainerRunState::Running
          } else {
            ContainerRunState::Exited
          },
          labels: c.labels.clone(),
        })
        .collect(),
    )
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerDetails> {
    self.check_alive()?;
    let containers = self.containers.lock().unwrap();
    let container = containers
      .get(name)
      .ok_or_else(|| anyhow::anyhow!("no such container {name}"))?;
    let health = if container.has_healthcheck {
      Some(
        self
          .health_overrides
          .lock()
          .unwrap()
          .get(name)
          .copied()
          .unwrap_or(ContainerHealthKind::Healthy),
      )
    } else {
      None
    };
    Ok(ContainerDetails {
      id: container.id.clone(),
      name: name.to_string(),
      image: container.image.clone(),
      running: container.running,
      restarting: false,
      exit_code: container.exit_code,
      restart_count: container.restart_count,
      health,
      labels: container.labels.clone(),
    })
  }

  async fn create_container(
    &self,
    spec: ContainerSpec,
  ) -> anyhow::Result<String> {
    self.check_alive()?;
    let id = new_id();
    self.containers.lock().unwrap().insert(
      spec.name.clone(),
      FakeContainer {
        id: id.clone(),
        image: spec.image,
        running: false,
        exit_code: None,
        restart_count: 0,
        has_healthcheck: spec.healthcheck.is_some(),
        labels: spec.labels,
      },
    );
    Ok(id)
  }

  async fn start_container(&self, name: &str) -> anyhow::Result<()> {
    self.check_alive()?;
    let mut containers = self.containers.lock().unwrap();
    let container = containers
      .get_mut(name)
      .ok_or_else(|| anyhow::anyhow!("no such container {name}"))?;
    container.running = true;
    Ok(())
  }

  async fn stop_container(
    &self,
    name: &str,
    _grace_secs: u64,
  ) -> anyhow::Result<()> {
    self.check_alive()?;
    if let Some(container) =
      self.containers.lock().unwrap().get_mut(name)
    {
      container.running = false;
      container.exit_code = Some(0);
    }
    Ok(())
  }

  async fn kill_container(&self, name: &str) -> anyhow::Result<()> {
    self.stop_container(name, 0).await
  }

  async fn remove_container(
    &self,
    name: &str,
    _force: bool,
  ) -> anyhow::Result<()> {
    self.check_alive()?;
    if self.fail_removes.lock().unwrap().contains(name) {
      anyhow::bail!("device or resource busy: {name}");
    }
    self.containers.lock().unwrap().remove(name);
    Ok(())
  }

  async fn wait_container(
    &self,
    name: &str,
  ) -> anyhow::Result<i64> {
    self.check_alive()?;
    let exit_code = self
      .exit_codes
      .lock()
      .unwrap()
      .get(name)
      .copied()
      .unwrap_or(0);
    if let Some(container) =
      self.containers.lock().unwrap().get_mut(name)
    {
      container.running = false;
      container.exit_code = Some(exit_code);
    }
    Ok(exit_code)
  }

  async fn follow_logs(
    &self,
    name: &str,
  ) -> anyhow::Result<BoxStream<'static, String>> {
    self.check_alive()?;
    let lines = self
      .log_lines
      .lock()
      .unwrap()
      .get(name)
      .cloned()
      .unwrap_or_default();
    Ok(stream::iter(lines).boxed())
  }

  async fn pull_image(
    &self,
    image: &str,
    _auth: Option<RegistryAuth>,
  ) -> anyhow::Result<()> {
    self.check_alive()?;
    if self.fail_pulls.lock().unwrap().contains(image) {
      anyhow::bail!("manifest unknown for {image}");
    }
    self.pulled.lock().unwrap().push(image.to_string());
    Ok(())
  }

  async fn image_digest(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>> {
    self.check_alive()?;
    Ok(self.digests.lock().unwrap().get(image).cloned())
  }

  async fn create_network(
    &self,
    name: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    self.check_alive()?;
    self
      .networks
      .lock()
      .unwrap()
      .insert(name.to_string(), labels);
    Ok(())
  }

  async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
    self.check_alive()?;
    self.networks.lock().unwrap().remove(name);
    Ok(())
  }

  async fn list_networks(
    &self,
    filters: &[(String, String)],
  ) -> anyhow::Result<Vec<String>> {
    self.check_alive()?;
    Ok(
      self
        .networks
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, labels)| Self::matches(labels, filters))
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }

  async fn create_volume(
    &self,
    name: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    self.check_alive()?;
    self
      .volumes
      .lock()
      .unwrap()
      .insert(name.to_string(), labels);
    Ok(())
  }

  async fn remove_volume(&self, name: &str) -> anyhow::Result<()> {
    self.check_alive()?;
    self.volumes.lock().unwrap().remove(name);
    Ok(())
  }

  async fn list_volumes(
    &self,
    filters: &[(String, String)],
  ) -> anyhow::Result<Vec<String>> {
    self.check_alive()?;
    Ok(
      self
        .volumes
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, labels)| Self::matches(labels, filters))
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }
}

pub struct FakeConnector {
  pub docker: Arc<FakeDocker>,
}

#[async_trait]
impl DockerConnector for FakeConnector {
  async fn connect(
    &self,
    _environment: &Environment,
  ) -> anyhow::Result<Arc<dyn DockerApi>> {
    Ok(self.docker.clone())
  }
}

pub struct Harness {
  pub core: Arc<Core>,
  pub docker: Arc<FakeDocker>,
  pub environment: Environment,
}

/// A core wired to the fake daemon, with timeouts tightened so
/// failure paths resolve quickly.
pub async fn harness() -> Harness {
  let docker = Arc::new(FakeDocker::default());
  let config = CoreConfig {
    start_timeout_secs: 2,
    pull_timeout_secs: 30,
    init_timeout_secs: 30,
    stop_grace_secs: 1,
    ..Default::default()
  };
  let core = Core::new(
    config,
    Arc::new(MemoryStore::new()),
    Arc::new(FakeConnector {
      docker: docker.clone(),
    }),
  );
  let environment = Environment {
    id: String::from("env1"),
    name: String::from("test-env"),
    ..Default::default()
  };
  core
    .store
    .environments
    .put(&environment.id, &environment)
    .await
    .unwrap();
  Harness {
    core,
    docker,
    environment,
  }
}

pub async fn seed_definition(
  core: &Arc<Core>,
  id: &str,
  version: &str,
  compose: &str,
  variables: Vec<VariableSpec>,
) -> StackDefinition {
  let definition = StackDefinition {
    id: id.to_string(),
    name: id.to_string(),
    version: version.to_string(),
    compose_template: compose.to_string(),
    variables,
    ..Default::default()
  };
  core
    .store
    .stack_definitions
    .put(&definition.id, &definition)
    .await
    .unwrap();
  definition
}

/// Drain the session until its terminal progress event arrives.
pub async fn wait_terminal(
  receiver: &mut ProgressReceiver,
) -> ProgressEvent {
  let deadline = Duration::from_secs(30);
  tokio::time::timeout(deadline, async {
    loop {
      match receiver.recv().await {
        Some(BusEvent::Progress(event)) if event.is_complete => {
          return event;
        }
        Some(_) => continue,
        None => panic!("session closed before terminal event"),
      }
    }
  })
  .await
  .expect("no terminal event within deadline")
}

/// Collect every percent observed until the terminal event,
/// terminal included.
pub async fn collect_percents(
  receiver: &mut ProgressReceiver,
) -> Vec<u8> {
  let deadline = Duration::from_secs(30);
  tokio::time::timeout(deadline, async {
    let mut percents = Vec::new();
    loop {
      match receiver.recv().await {
        Some(BusEvent::Progress(event)) => {
          percents.push(event.percent_complete);
          if event.is_complete {
            return percents;
          }
        }
        Some(_) => continue,
        None => panic!("session closed before terminal event"),
      }
    }
  })
  .await
  .expect("no terminal event within deadline")
}
