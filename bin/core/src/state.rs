use std::{sync::Arc, time::Duration};

use cache::CloneCache;
use rsgo_client::entities::{
  config::CoreConfig,
  deployment::Deployment,
  environment::Environment,
  health::HealthState,
};
use tokio_util::sync::CancellationToken;

use crate::{
  docker::{DockerApi, DockerConnector},
  error::{ExecuteError, ExecuteResult},
  helpers::action_state::ActionStates,
  progress::ProgressBus,
  snapshot::Snapshots,
  store::{KvStore, Store},
};

/// Outcome cache for `(deployment, attempt_id)` idempotence.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
  pub deployment_id: String,
  pub session_id: String,
  pub finished: bool,
}

/// The wired component set. Constructed once by the supervisor
/// and handed to every request resolver and background task; no
/// global service locator exists.
pub struct Core {
  pub config: CoreConfig,
  pub store: Store,
  pub snapshots: Snapshots,
  pub bus: Arc<ProgressBus>,
  pub connector: Arc<dyn DockerConnector>,
  pub action_states: ActionStates,
  pub attempts: CloneCache<String, AttemptRecord>,
  /// Cancellation handles of in-flight operations, by deployment.
  pub operations: CloneCache<String, CancellationToken>,
  pub monitor: MonitorState,
}

/// Working state of the health monitor, per environment and per
/// deployment.
#[derive(Default)]
pub struct MonitorState {
  /// Serializes reconciles per environment and rate limits
  /// forced refreshes. Holds the unix ms of the last cycle.
  pub controllers:
    CloneCache<String, Arc<tokio::sync::Mutex<i64>>>,
  /// Most recent sample per deployment, for change detection.
  pub last_samples: CloneCache<String, HealthState>,
}

impl Core {
  pub fn new(
    config: CoreConfig,
    kv: Arc<dyn KvStore>,
    connector: Arc<dyn DockerConnector>,
  ) -> Arc<Core> {
    let store = Store::new(kv);
    let snapshots = Snapshots::new(store.snapshots.clone());
    let bus = Arc::new(ProgressBus::new(
      config.progress_queue_capacity,
      Duration::from_secs(config.progress_retention_secs),
    ));
    Arc::new(Core {
      config,
      store,
      snapshots,
      bus,
      connector,
      action_states: Default::default(),
      attempts: Default::default(),
      operations: Default::default(),
      monitor: Default::default(),
    })
  }

  pub async fn environment(
    &self,
    id: &str,
  ) -> ExecuteResult<Environment> {
    self
      .store
      .environments
      .get(id)
      .await
      .map_err(ExecuteError::internal)?
      .ok_or_else(|| ExecuteError::not_found("Environment", id))
  }

  pub async fn deployment(
    &self,
    id: &str,
  ) -> ExecuteResult<Deployment> {
    self
      .store
      .deployments
      .get(id)
      .await
      .map_err(ExecuteError::internal)?
      .ok_or_else(|| ExecuteError::not_found("Deployment", id))
  }

  /// Daemon handle for an environment. Connection failures are
  /// the caller-visible `DockerUnavailable`.
  pub async fn docker_for(
    &self,
    environment: &Environment,
  ) -> ExecuteResult<Arc<dyn DockerApi>> {
    self
      .connector
      .connect(environment)
      .await
      .map_err(|e| ExecuteError::DockerUnavailable(format!("{e:#}")))
  }

  /// Apply `apply` to a copy of `current` and swap it in,
  /// conditioned on the stored record still matching `current`.
  /// Losing the swap surfaces as `OperationInProgress`.
  pub async fn transition(
    &self,
    current: &Deployment,
    apply: impl FnOnce(&mut Deployment),
  ) -> ExecuteResult<Deployment> {
    let mut next = current.clone();
    apply(&mut next);
    match self
      .store
      .deployments
      .compare_and_swap(&current.id, current, &next)
      .await
    {
      Ok(true) => Ok(next),
      Ok(false) => Err(ExecuteError::OperationInProgress {
        deployment: current.id.clone(),
      }),
      Err(e) => Err(ExecuteError::internal(e)),
    }
  }

  /// Unconditional write, for updates made while the operation
  /// task exclusively owns the record (action guard held).
  pub async fn persist(
    &self,
    deployment: &Deployment,
  ) -> ExecuteResult<()> {
    self
      .store
      .deployments
      .put(&deployment.id, deployment)
      .await
      .map_err(ExecuteError::internal)
  }

  /// Live stream of one operation session: the retained event
  /// first, then everything after it in publish order.
  pub fn subscribe_progress(
    &self,
    session_id: &str,
  ) -> crate::progress::ProgressReceiver {
    self.bus.subscribe(session_id)
  }

  /// Health summaries for every deployment in one environment.
  pub fn subscribe_environment_health(
    &self,
    environment_id: &str,
  ) -> tokio::sync::broadcast::Receiver<
    rsgo_client::entities::health::HealthSummary,
  > {
    self.bus.subscribe_environment_health(environment_id)
  }
}
