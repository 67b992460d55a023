use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bollard::{
  Docker,
  auth::DockerCredentials,
  query_parameters::{
    CreateContainerOptions, CreateImageOptions,
    InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, ListNetworksOptions, ListVolumesOptions,
    LogsOptions, RemoveContainerOptions, RemoveVolumeOptions,
    StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
  },
  secret::{
    ContainerCreateBody, HealthConfig, HostConfig,
    NetworkCreateRequest, PortBinding, RestartPolicy,
    RestartPolicyNameEnum, VolumeCreateOptions,
  },
};
use futures_util::{StreamExt, TryStreamExt, stream::BoxStream};
use rsgo_client::entities::environment::Environment;

use super::{
  ContainerDetails, ContainerHealthKind, ContainerRunState,
  ContainerSpec, ContainerSummary, DockerApi, DockerConnector,
  RegistryAuth,
};

/// Shared, thread-safe facade over one daemon endpoint.
pub struct DockerClient {
  docker: Docker,
}

impl DockerClient {
  /// Connect per the environment's address: empty means the
  /// platform default socket, otherwise `unix://` or `tcp://`.
  pub fn connect(
    environment: &Environment,
  ) -> anyhow::Result<DockerClient> {
    let docker = if environment.is_local_default() {
      Docker::connect_with_defaults()
        .context("failed to connect to default docker socket")?
    } else if environment.address.starts_with("unix://") {
      Docker::connect_with_unix(
        &environment.address,
        120,
        bollard::API_DEFAULT_VERSION,
      )
      .with_context(|| {
        format!("failed to connect to {}", environment.address)
      })?
    } else {
      Docker::connect_with_http(
        &environment.address,
        120,
        bollard::API_DEFAULT_VERSION,
      )
      .with_context(|| {
        format!("failed to connect to {}", environment.address)
      })?
    };
    Ok(DockerClient { docker })
  }
}

fn label_filters(
  pairs: &[(String, String)],
) -> Option<HashMap<String, Vec<String>>> {
  if pairs.is_empty() {
    return None;
  }
  let labels = pairs
    .iter()
    .map(|(key, value)| format!("{key}={value}"))
    .collect::<Vec<_>>();
  Some(HashMap::from([(String::from("label"), labels)]))
}

#[async_trait]
impl DockerApi for DockerClient {
  async fn ping(&self) -> anyhow::Result<()> {
    self
      .docker
      .ping()
      .await
      .context("docker daemon did not answer ping")?;
    Ok(())
  }

  async fn list_containers(
    &self,
    filters: &[(String, String)],
  ) -> anyhow::Result<Vec<ContainerSummary>> {
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        filters: label_filters(filters),
        ..Default::default()
      }))
      .await?;
    let containers = containers
      .into_iter()
      .flat_map(|container| {
        let name = container
          .names
          .context("no names on container")?
          .pop()
          .context("no names on container (empty vec)")?
          .replace('/', "");
        anyhow::Ok(ContainerSummary {
          id: container.id.unwrap_or_default(),
          name,
          image: container.image.unwrap_or_default(),
          state: container
            .state
            .map(convert_summary_state)
            .unwrap_or_default(),
          labels: container.labels.unwrap_or_default(),
        })
      })
      .collect();
    Ok(containers)
  }

  async fn inspect_container(
    &self,
    name_or_id: &str,
  ) -> anyhow::Result<ContainerDetails> {
    let container = self
      .docker
      .inspect_container(
        name_or_id,
        Option::<InspectContainerOptions>::None,
      )
      .await?;
    let state = container.state;
    let (running, restarting, exit_code, health) = state
      .map(|state| {
        (
          state.running.unwrap_or_default(),
          state.restarting.unwrap_or_default(),
          state.exit_code,
          state
            .health
            .and_then(|health| health.status)
            .and_then(convert_health_status),
        )
      })
      .unwrap_or_default();
    Ok(ContainerDetails {
      id: container.id.unwrap_or_default(),
      name: container
        .name
        .map(|name| name.replace('/', ""))
        .unwrap_or_default(),
      image: container.image.unwrap_or_default(),
      running,
      restarting,
      exit_code,
      restart_count: container
        .restart_count
        .map(|count| count.max(0) as u64)
        .unwrap_or_default(),
      health,
      labels: container
        .config
        .and_then(|config| config.labels)
        .unwrap_or_default(),
    })
  }

  async fn create_container(
    &self,
    spec: ContainerSpec,
  ) -> anyhow::Result<String> {
    let exposed_ports = if spec.ports.is_empty() {
      None
    } else {
      Some(
        spec
          .ports
          .iter()
          .map(|port| {
            (
              format!("{}/{}", port.container, port.protocol),
              Default::default(),
            )
          })
          .collect(),
      )
    };
    let port_bindings = if spec.ports.is_empty() {
      None
    } else {
      Some(
        spec
          .ports
          .iter()
          .map(|port| {
            (
              format!("{}/{}", port.container, port.protocol),
              Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.host.to_string()),
              }]),
            )
          })
          .collect(),
      )
    };
    let healthcheck = spec.healthcheck.map(|check| HealthConfig {
      test: Some(check.test),
      interval: check.interval_secs.map(secs_to_nanos),
      timeout: check.timeout_secs.map(secs_to_nanos),
      retries: check.retries.map(|r| r as i64),
      start_period: check.start_period_secs.map(secs_to_nanos),
      start_interval: None,
    });
    let host_config = HostConfig {
      port_bindings,
      restart_policy: Some(RestartPolicy {
        name: Some(convert_restart_policy(&spec.restart)),
        maximum_retry_count: None,
      }),
      binds: (!spec.binds.is_empty()).then_some(spec.binds),
      network_mode: spec.network,
      ..Default::default()
    };
    let response = self
      .docker
      .create_container(
        Some(CreateContainerOptions {
          name: Some(spec.name),
          ..Default::default()
        }),
        ContainerCreateBody {
          image: Some(spec.image),
          env: (!spec.env.is_empty()).then_some(spec.env),
          labels: Some(spec.labels),
          exposed_ports,
          healthcheck,
          host_config: Some(host_config),
          ..Default::default()
        },
      )
      .await?;
    Ok(response.id)
  }

  async fn start_container(&self, name: &str) -> anyhow::Result<()> {
    self
      .docker
      .start_container(name, Option::<StartContainerOptions>::None)
      .await?;
    Ok(())
  }

  async fn stop_container(
    &self,
    name: &str,
    grace_secs: u64,
  ) -> anyhow::Result<()> {
    self
      .docker
      .stop_container(
        name,
        Some(StopContainerOptions {
          t: Some(grace_secs as i32),
          ..Default::default()
        }),
      )
      .await?;
    Ok(())
  }

  async fn kill_container(&self, name: &str) -> anyhow::Result<()> {
    self
      .docker
      .kill_container(name, Option::<KillContainerOptions>::None)
      .await?;
    Ok(())
  }

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    self
      .docker
      .remove_container(
        name,
        Some(RemoveContainerOptions {
          force,
          ..Default::default()
        }),
      )
      .await?;
    Ok(())
  }

  async fn wait_container(
    &self,
    name: &str,
  ) -> anyhow::Result<i64> {
    let mut responses = self
      .docker
      .wait_container(name, Option::<WaitContainerOptions>::None)
      .collect::<Vec<_>>()
      .await;
    match responses.pop() {
      Some(Ok(response)) => Ok(response.status_code),
      // The daemon reports non-zero exits of awaited containers
      // as an error variant carrying the code.
      Some(Err(bollard::errors::Error::DockerContainerWaitError {
        code,
        ..
      })) => Ok(code),
      Some(Err(e)) => {
        Err(anyhow::Error::from(e).context("failed to await container"))
      }
      None => Err(anyhow!("wait stream ended without a response")),
    }
  }

  async fn follow_logs(
    &self,
    name: &str,
  ) -> anyhow::Result<BoxStream<'static, String>> {
    let stream = self
      .docker
      .logs(
        name,
        Some(LogsOptions {
          follow: true,
          stdout: true,
          stderr: true,
          ..Default::default()
        }),
      )
      .filter_map(|output| async move {
        match output {
          Ok(output) => Some(
            String::from_utf8_lossy(&output.into_bytes())
              .into_owned(),
          ),
          Err(_) => None,
        }
      })
      .flat_map(|chunk| {
        futures_util::stream::iter(
          chunk
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect::<Vec<_>>(),
        )
      });
    Ok(stream.boxed())
  }

  async fn pull_image(
    &self,
    image: &str,
    auth: Option<RegistryAuth>,
  ) -> anyhow::Result<()> {
    let credentials = auth.map(|auth| DockerCredentials {
      username: Some(auth.username),
      password: Some(auth.password),
      serveraddress: Some(auth.server_address),
      ..Default::default()
    });
    self
      .docker
      .create_image(
        Some(CreateImageOptions {
          from_image: Some(image.to_string()),
          ..Default::default()
        }),
        None,
        credentials,
      )
      .try_collect::<Vec<_>>()
      .await
      .with_context(|| format!("failed to pull {image}"))?;
    Ok(())
  }

  async fn image_digest(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<String>> {
    let image = self.docker.inspect_image(image).await?;
    Ok(
      image
        .repo_digests
        .unwrap_or_default()
        .into_iter()
        .next(),
    )
  }

  async fn create_network(
    &self,
    name: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    self
      .docker
      .create_network(NetworkCreateRequest {
        name: name.to_string(),
        labels: Some(labels),
        ..Default::default()
      })
      .await?;
    Ok(())
  }

  async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
    self.docker.remove_network(name).await?;
    Ok(())
  }

  async fn list_networks(
    &self,
    filters: &[(String, String)],
  ) -> anyhow::Result<Vec<String>> {
    let networks = self
      .docker
      .list_networks(Some(ListNetworksOptions {
        filters: label_filters(filters),
        ..Default::default()
      }))
      .await?;
    Ok(
      networks
        .into_iter()
        .filter_map(|network| network.name)
        .collect(),
    )
  }

  async fn create_volume(
    &self,
    name: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    self
      .docker
      .create_volume(VolumeCreateOptions {
        name: Some(name.to_string()),
        labels: Some(labels),
        ..Default::default()
      })
      .await?;
    Ok(())
  }

  async fn remove_volume(&self, name: &str) -> anyhow::Result<()> {
    self
      .docker
      .remove_volume(name, Option::<RemoveVolumeOptions>::None)
      .await?;
    Ok(())
  }

  async fn list_volumes(
    &self,
    filters: &[(String, String)],
  ) -> anyhow::Result<Vec<String>> {
    let volumes = self
      .docker
      .list_volumes(Some(ListVolumesOptions {
        filters: label_filters(filters),
        ..Default::default()
      }))
      .await?;
    Ok(
      volumes
        .volumes
        .unwrap_or_default()
        .into_iter()
        .map(|volume| volume.name)
        .collect(),
    )
  }
}

/// Production connector: one cached bollard client per environment.
#[derive(Default)]
pub struct BollardConnector {
  clients: cache::CloneCache<String, Arc<DockerClient>>,
}

#[async_trait]
impl DockerConnector for BollardConnector {
  async fn connect(
    &self,
    environment: &Environment,
  ) -> anyhow::Result<Arc<dyn DockerApi>> {
    if let Some(client) = self.clients.get(&environment.id).await {
      return Ok(client);
    }
    let client = Arc::new(DockerClient::connect(environment)?);
    self
      .clients
      .insert(environment.id.clone(), client.clone())
      .await;
    Ok(client)
  }
}

fn secs_to_nanos(secs: u64) -> i64 {
  Duration::from_secs(secs).as_nanos() as i64
}

fn convert_restart_policy(name: &str) -> RestartPolicyNameEnum {
  match name {
    "always" => RestartPolicyNameEnum::ALWAYS,
    "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
    "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
    _ => RestartPolicyNameEnum::NO,
  }
}

fn convert_summary_state(
  state: bollard::secret::ContainerSummaryStateEnum,
) -> ContainerRunState {
  use bollard::secret::ContainerSummaryStateEnum::*;
  match state {
    CREATED => ContainerRunState::Created,
    RUNNING => ContainerRunState::Running,
    PAUSED => ContainerRunState::Paused,
    RESTARTING => ContainerRunState::Restarting,
    EXITED => ContainerRunState::Exited,
    REMOVING => ContainerRunState::Removing,
    DEAD => ContainerRunState::Dead,
    EMPTY => ContainerRunState::Unknown,
  }
}

fn convert_health_status(
  status: bollard::secret::HealthStatusEnum,
) -> Option<ContainerHealthKind> {
  use bollard::secret::HealthStatusEnum::*;
  match status {
    STARTING => Some(ContainerHealthKind::Starting),
    HEALTHY => Some(ContainerHealthKind::Healthy),
    UNHEALTHY => Some(ContainerHealthKind::Unhealthy),
    NONE | EMPTY => None,
  }
}
