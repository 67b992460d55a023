//! The deployment engine: the per-stack state machine driving
//! Install / Upgrade / Rollback / Remove against one daemon,
//! publishing phase progress on the session.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Duration,
};

use futures_util::{StreamExt, stream};
use rsgo_client::entities::{
  deployment::{Deployment, OperationKind, ServiceInstance},
  environment::Environment,
  labels,
  progress::{ProgressEvent, ProgressPhase},
  source::StackDefinition,
};
use tokio_util::sync::CancellationToken;
use variables::Renderer;

use crate::{
  docker::{ContainerSpec, DockerApi, with_retries},
  error::{ExecuteError, ExecuteResult},
  plan::{ServiceNode, ServicePlan},
  progress::ProgressBus,
  registry,
  state::Core,
};

mod init_containers;
pub mod install;
pub mod remove;
pub mod rollback;
pub mod upgrade;

pub use install::launch_install;
pub use remove::launch_remove;
pub use rollback::launch_rollback;
pub use upgrade::launch_upgrade;

/// Handle on a launched operation task. The task has already
/// performed its own failure handling by the time it resolves;
/// the carried result is informational for orchestration.
pub type OpHandle = tokio::task::JoinHandle<ExecuteResult<()>>;

/// Everything an operation task carries.
pub(crate) struct OpCtx {
  pub core: Arc<Core>,
  pub environment: Environment,
  pub docker: Arc<dyn DockerApi>,
  pub progress: OperationProgress,
  pub cancel: CancellationToken,
}

impl OpCtx {
  pub async fn open(
    core: Arc<Core>,
    environment: Environment,
    progress: OperationProgress,
    deployment_id: &str,
  ) -> ExecuteResult<OpCtx> {
    let docker = core.docker_for(&environment).await?;
    let cancel = CancellationToken::new();
    core
      .operations
      .insert(deployment_id.to_string(), cancel.clone())
      .await;
    Ok(OpCtx {
      core,
      environment,
      docker,
      progress,
      cancel,
    })
  }

  pub async fn close(&self, deployment_id: &str) {
    self.core.operations.remove(&deployment_id.to_string()).await;
  }

  /// Run one phase under its deadline and the operation's cancel
  /// signal. `on_timeout` shapes the deadline error.
  pub async fn phase<T>(
    &self,
    deadline: Duration,
    on_timeout: impl FnOnce() -> ExecuteError,
    fut: impl Future<Output = ExecuteResult<T>>,
  ) -> ExecuteResult<T> {
    tokio::select! {
      _ = self.cancel.cancelled() => {
        Err(ExecuteError::Validation(String::from(
          "operation cancelled",
        )))
      }
      res = tokio::time::timeout(deadline, fut) => match res {
        Ok(res) => res,
        Err(_) => Err(on_timeout()),
      },
    }
  }
}

#[derive(Clone, Copy, Default)]
struct Totals {
  total_services: u64,
  total_init_containers: u64,
  completed_services: u64,
  completed_init_containers: u64,
}

/// Session-scoped progress emitter. Maps phase bands to percent,
/// optionally compressed into a product slot `k` of `n`.
#[derive(Clone)]
pub struct OperationProgress {
  bus: Arc<ProgressBus>,
  pub session_id: String,
  band_offset: f64,
  band_scale: f64,
  /// False while running inside a product operation: the
  /// orchestrator owns the terminal event.
  terminal_allowed: bool,
  totals: Arc<Mutex<Totals>>,
}

impl OperationProgress {
  pub fn new(
    bus: Arc<ProgressBus>,
    session_id: impl Into<String>,
  ) -> OperationProgress {
    OperationProgress {
      bus,
      session_id: session_id.into(),
      band_offset: 0.0,
      band_scale: 1.0,
      terminal_allowed: true,
      totals: Default::default(),
    }
  }

  /// Compress all emissions into slot `index` of `count`, for
  /// stack `k` of a product operation.
  pub fn compressed(
    bus: Arc<ProgressBus>,
    session_id: impl Into<String>,
    index: usize,
    count: usize,
  ) -> OperationProgress {
    let count = count.max(1) as f64;
    OperationProgress {
      bus,
      session_id: session_id.into(),
      band_offset: index as f64 / count * 100.0,
      band_scale: 1.0 / count,
      terminal_allowed: false,
      totals: Default::default(),
    }
  }

  pub fn set_totals(&self, services: u64, init_containers: u64) {
    let mut totals = self.totals.lock().expect("totals poisoned");
    totals.total_services = services;
    totals.total_init_containers = init_containers;
  }

  fn scaled(&self, percent: u8) -> u8 {
    (self.band_offset + percent as f64 * self.band_scale)
      .round()
      .clamp(0.0, 100.0) as u8
  }

  fn event(&self, phase: ProgressPhase) -> ProgressEvent {
    let totals = *self.totals.lock().expect("totals poisoned");
    ProgressEvent {
      session_id: self.session_id.clone(),
      phase,
      total_services: totals.total_services,
      completed_services: totals.completed_services,
      total_init_containers: totals.total_init_containers,
      completed_init_containers: totals.completed_init_containers,
      ..Default::default()
    }
  }

  /// Entering a phase: percent sits at the band's low edge.
  pub fn enter(&self, phase: ProgressPhase, message: impl Into<String>) {
    let mut event = self.event(phase);
    event.message = message.into();
    event.percent_complete = self.scaled(phase.band().0);
    self.bus.publish(event);
  }

  /// `completed` of `total` units done within the phase band.
  pub fn step(
    &self,
    phase: ProgressPhase,
    message: impl Into<String>,
    current: Option<&str>,
    completed: u64,
    total: u64,
  ) {
    {
      let mut totals =
        self.totals.lock().expect("totals poisoned");
      match phase {
        ProgressPhase::InitializingContainers => {
          totals.completed_init_containers = completed
        }
        ProgressPhase::StartingServices => {
          totals.completed_services = completed
        }
        _ => {}
      }
    }
    let mut event = self.event(phase);
    event.message = message.into();
    event.current_service = current.map(str::to_string);
    event.percent_complete =
      self.scaled(phase.percent_at(completed, total));
    self.bus.publish(event);
  }

  /// The single successful terminal event for the session.
  pub fn complete(&self, message: impl Into<String>) {
    let mut event = self.event(ProgressPhase::Finalizing);
    event.message = message.into();
    event.percent_complete = self.scaled(100);
    event.is_complete = self.terminal_allowed;
    self.bus.publish(event);
  }

  /// The single failed terminal event for the session.
  pub fn fail(&self, phase: ProgressPhase, error: &ExecuteError) {
    let mut event = self.event(phase);
    event.message = String::from("operation failed");
    event.is_error = true;
    event.error_message = Some(error.failure_reason());
    event.is_complete = self.terminal_allowed;
    self.bus.publish(event);
  }
}

/// Render the definition's compose template with the resolved
/// variables and normalize it into a plan.
pub(crate) fn render_and_plan(
  core: &Core,
  definition: &StackDefinition,
  resolved: &HashMap<String, String>,
) -> ExecuteResult<(String, ServicePlan)> {
  for variable in &definition.variables {
    if variable.is_required
      && variable.default_value.is_none()
      && !resolved.contains_key(&variable.name)
    {
      return Err(ExecuteError::validation(format!(
        "required variable {} not provided",
        variable.name
      )));
    }
  }

  let secrets = crate::helpers::secret_variable_names(definition);
  let mut renderer =
    Renderer::new(resolved).with_secrets(secrets);
  let compose = renderer
    .render(&definition.compose_template)
    .map_err(|e| ExecuteError::validation(e.to_string()))?;

  let plan = crate::plan::plan(
    &compose,
    &core.config.allowed_volume_roots,
  )
  .map_err(|e| ExecuteError::PlanInvalid(e.to_string()))?;

  Ok((compose, plan))
}

pub(crate) fn container_name(stack: &str, service: &str) -> String {
  format!("{stack}-{service}")
}

pub(crate) fn network_name(stack: &str) -> String {
  format!("rsgo-{stack}")
}

pub(crate) fn volume_name(stack: &str, volume: &str) -> String {
  format!("{stack}_{volume}")
}

/// The labels stamped on every container, network and volume the
/// engine creates.
pub(crate) fn stack_labels(
  deployment: &Deployment,
  version: &str,
  service: Option<&str>,
) -> HashMap<String, String> {
  let mut set = HashMap::from([
    (labels::DEPLOYMENT.to_string(), deployment.id.clone()),
    (labels::STACK.to_string(), deployment.stack_name.clone()),
    (labels::MANAGED.to_string(), String::from("true")),
    (labels::VERSION.to_string(), version.to_string()),
  ]);
  if let Some(service) = service {
    set.insert(labels::SERVICE.to_string(), service.to_string());
  }
  set
}

/// Label filter selecting everything owned by one deployment.
pub(crate) fn deployment_filter(
  deployment_id: &str,
) -> Vec<(String, String)> {
  vec![(
    labels::DEPLOYMENT.to_string(),
    deployment_id.to_string(),
  )]
}

/// Pull every image of the plan, `fanout` at a time, emitting
/// pull progress across the PullingImages band. `digests` remaps
/// image references to pinned digest references (rollback).
pub(crate) async fn pull_images(
  ctx: &OpCtx,
  images: &[String],
  digests: Option<&HashMap<String, String>>,
) -> ExecuteResult<()> {
  let credentials = ctx
    .core
    .store
    .registry_credentials
    .list()
    .await
    .map_err(ExecuteError::internal)?;

  let total = images.len() as u64;
  let completed = Arc::new(std::sync::atomic::AtomicU64::new(0));

  let results = stream::iter(images.iter().map(|image| {
    let pull_ref = digests
      .and_then(|digests| digests.get(image))
      .cloned()
      .unwrap_or_else(|| image.clone());
    let credential =
      registry::resolve_credential(image, &credentials).cloned();
    let completed = completed.clone();
    async move {
      let auth = credential
        .as_ref()
        .and_then(|c| registry::auth_for(c, image));
      with_retries("docker pull", || {
        ctx.docker.pull_image(&pull_ref, auth.clone())
      })
      .await
      .map_err(|e| ExecuteError::ImagePullFailed {
        image: image.clone(),
        cause: format!("{e:#}"),
      })?;
      let done = completed
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        + 1;
      ctx.progress.step(
        ProgressPhase::PullingImages,
        format!("Pulled {pull_ref}"),
        None,
        done,
        total,
      );
      ExecuteResult::Ok(())
    }
  }))
  .buffer_unordered(ctx.core.config.pull_fanout.max(1))
  .collect::<Vec<_>>()
  .await;

  for result in results {
    result?;
  }
  Ok(())
}

/// Read back repo digests for the images of a plan, keyed by the
/// image reference. Missing digests are skipped.
pub(crate) async fn read_image_digests(
  docker: &Arc<dyn DockerApi>,
  images: &[String],
) -> HashMap<String, String> {
  let mut digests = HashMap::new();
  for image in images {
    match docker.image_digest(image).await {
      Ok(Some(digest)) => {
        digests.insert(image.clone(), digest);
      }
      Ok(None) => {}
      Err(e) => {
        debug!("no digest for {image} | {e:#}")
      }
    }
  }
  digests
}

/// Create and start one service container.
pub(crate) async fn create_and_start(
  ctx: &OpCtx,
  deployment: &Deployment,
  version: &str,
  node: &ServiceNode,
) -> ExecuteResult<ServiceInstance> {
  let name = container_name(&deployment.stack_name, &node.name);
  let mut node_labels = node.labels.clone();
  node_labels.extend(stack_labels(
    deployment,
    version,
    Some(&node.name),
  ));
  let binds = node
    .binds
    .iter()
    .map(|bind| match bind.split_once(':') {
      // Named volume sources get the stack prefix; host paths
      // (absolute or relative) bind as written.
      Some((source, rest))
        if !source.starts_with('/')
          && !source.starts_with('.') =>
      {
        format!(
          "{}:{rest}",
          volume_name(&deployment.stack_name, source)
        )
      }
      _ => bind.clone(),
    })
    .collect();
  let spec = ContainerSpec {
    name: name.clone(),
    image: node.image.clone(),
    env: node.env.clone(),
    labels: node_labels,
    ports: node.ports.clone(),
    restart: node.restart.clone(),
    healthcheck: node.healthcheck.clone(),
    network: Some(network_name(&deployment.stack_name)),
    binds,
  };
  let container_id = with_retries("container create", || {
    ctx.docker.create_container(spec.clone())
  })
  .await
  .map_err(|e| {
    ExecuteError::internal(
      e.context(format!("failed to create container {name}")),
    )
  })?;
  with_retries("container start", || {
    ctx.docker.start_container(&name)
  })
  .await
  .map_err(|e| {
    ExecuteError::internal(
      e.context(format!("failed to start container {name}")),
    )
  })?;
  Ok(ServiceInstance {
    service_name: node.name.clone(),
    container_id: Some(container_id),
    image: node.image.clone(),
    ports: node
      .ports
      .iter()
      .map(|p| format!("{}:{}", p.host, p.container))
      .collect(),
  })
}

/// Wait for a started service to settle: `Healthy` when it has a
/// healthcheck, running without restarts otherwise.
pub(crate) async fn wait_for_service(
  ctx: &OpCtx,
  deployment: &Deployment,
  node: &ServiceNode,
) -> ExecuteResult<()> {
  use crate::docker::ContainerHealthKind;

  let name = container_name(&deployment.stack_name, &node.name);
  let deadline =
    Duration::from_secs(ctx.core.config.start_timeout_secs);
  let started = tokio::time::Instant::now();

  loop {
    if started.elapsed() > deadline {
      return Err(ExecuteError::ServiceStartTimeout {
        service: node.name.clone(),
      });
    }
    match ctx.docker.inspect_container(&name).await {
      Ok(details) => match details.health {
        Some(ContainerHealthKind::Healthy) => return Ok(()),
        Some(ContainerHealthKind::Unhealthy) => {
          return Err(ExecuteError::ServiceStartTimeout {
            service: node.name.clone(),
          });
        }
        Some(ContainerHealthKind::Starting) => {}
        None => {
          if node.healthcheck.is_none()
            && details.running
            && details.restart_count == 0
          {
            return Ok(());
          }
          if !details.running && !details.restarting {
            return Err(ExecuteError::ServiceStartTimeout {
              service: node.name.clone(),
            });
          }
        }
      },
      Err(e) => {
        debug!("inspect {name} while waiting | {e:#}");
      }
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
  }
}

/// Start the plan's services layer by layer: create+start within
/// a layer in parallel, then hold until every service of the
/// layer settles before the next layer begins.
pub(crate) async fn start_services(
  ctx: &OpCtx,
  deployment: &Deployment,
  version: &str,
  plan: &ServicePlan,
  mut existing: Vec<ServiceInstance>,
) -> ExecuteResult<Vec<ServiceInstance>> {
  let total = plan.services.len() as u64;
  let mut completed = existing.len() as u64;

  for layer in &plan.layers {
    let nodes = layer
      .iter()
      .filter_map(|name| plan.service(name))
      .filter(|node| {
        !existing
          .iter()
          .any(|instance| instance.service_name == node.name)
      })
      .collect::<Vec<_>>();
    if nodes.is_empty() {
      continue;
    }

    let mut instances = Vec::with_capacity(nodes.len());
    let started = stream::iter(
      nodes
        .iter()
        .map(|node| create_and_start(ctx, deployment, version, node)),
    )
    .buffer_unordered(nodes.len())
    .collect::<Vec<_>>()
    .await;
    for instance in started {
      instances.push(instance?);
    }

    for node in &nodes {
      wait_for_service(ctx, deployment, node).await?;
      completed += 1;
      ctx.progress.step(
        ProgressPhase::StartingServices,
        format!("Service {} started", node.name),
        Some(&node.name),
        completed,
        total,
      );
    }
    existing.extend(instances);
  }

  // Keep dependency order for later reverse-order removal.
  existing.sort_by_key(|instance| {
    plan
      .services
      .iter()
      .position(|node| node.name == instance.service_name)
      .unwrap_or(usize::MAX)
  });
  Ok(existing)
}

/// Terminal failure path shared by every operation: persist
/// `Failed` with the reason and emit the terminal error event.
/// Containers already created stay in place for the operator.
pub(crate) async fn fail_deployment(
  core: &Core,
  deployment_id: &str,
  operation: OperationKind,
  phase: ProgressPhase,
  error: &ExecuteError,
  progress: &OperationProgress,
) {
  use rsgo_client::entities::deployment::DeploymentStatus;

  match core.store.deployments.get(deployment_id).await {
    Ok(Some(mut deployment)) => {
      deployment.status = DeploymentStatus::Failed;
      deployment.last_operation = Some(operation);
      deployment.last_failure_reason =
        Some(error.failure_reason());
      if let Err(e) = core.persist(&deployment).await {
        error!(
          "failed to persist Failed status for {deployment_id} | {e:#}"
        );
      }
    }
    Ok(None) => {}
    Err(e) => {
      error!(
        "failed to load {deployment_id} for failure handling | {e:#}"
      );
    }
  }
  progress.fail(phase, error);
}
