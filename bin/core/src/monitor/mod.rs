//! The health monitor: one reconcile loop per environment,
//! correlating containers to deployments by the `rsgo.*` labels
//! and reducing them to per-stack health samples.

use std::{collections::HashMap, sync::Arc, time::Duration};

use rsgo_client::entities::{
  deployment::Deployment,
  environment::Environment,
  health::{HealthHistory, HealthState, StackHealthStatus},
  labels, rsgo_timestamp,
};
use tokio_util::sync::CancellationToken;

use crate::{
  docker::{ContainerDetails, ContainerSummary, DockerApi},
  state::Core,
};

mod helpers;

pub use helpers::{
  derive_overall, derive_service_health, operation_mode,
  unknown_sample,
};

/// How hard one reconcile cycle may run.
const CYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervises one long-lived reconcile loop per environment,
/// following environments as they are added and removed.
pub fn spawn_monitor(core: Arc<Core>) {
  tokio::spawn(async move {
    let mut loops: HashMap<String, CancellationToken> =
      HashMap::new();
    loop {
      match core.store.environments.list().await {
        Ok(environments) => {
          let alive = environments
            .iter()
            .map(|e| e.id.clone())
            .collect::<Vec<_>>();
          loops.retain(|id, cancel| {
            let keep = alive.contains(id);
            if !keep {
              cancel.cancel();
            }
            keep
          });
          for environment in environments {
            loops
              .entry(environment.id.clone())
              .or_insert_with(|| {
                let cancel = CancellationToken::new();
                tokio::spawn(environment_loop(
                  core.clone(),
                  environment,
                  cancel.clone(),
                ));
                cancel
              });
          }
        }
        Err(e) => {
          error!("failed to list environments for monitor | {e:#}")
        }
      }
      tokio::time::sleep(Duration::from_secs(30)).await;
    }
  });
}

async fn environment_loop(
  core: Arc<Core>,
  environment: Environment,
  cancel: CancellationToken,
) {
  let base = core.config.monitoring_interval_secs.max(1);
  loop {
    // ±10% jitter keeps environment loops from herding.
    let jitter = rand::random_range(-0.1..=0.1);
    let interval =
      Duration::from_secs_f64(base as f64 * (1.0 + jitter));
    tokio::select! {
      _ = cancel.cancelled() => return,
      _ = tokio::time::sleep(interval) => {}
    }
    update_health_for_environment(&core, &environment, false)
      .await;
  }
}

/// Run one reconcile for the environment.
///
/// The background loop passes `force: false`, skipping when a
/// cycle is already running or one finished within the last
/// second. Forced refreshes wait their turn instead.
pub async fn update_health_for_environment(
  core: &Arc<Core>,
  environment: &Environment,
  force: bool,
) {
  let controller = core
    .monitor
    .controllers
    .get_or_insert_default(&environment.id)
    .await;
  let mut last_run = match controller.try_lock() {
    Ok(lock) => lock,
    Err(_) if force => controller.lock().await,
    Err(_) => {
      warn!(
        "skipping health reconcile for {}: previous still running",
        environment.name
      );
      return;
    }
  };

  let now = rsgo_timestamp();
  if !force && *last_run > now - 1_000 {
    return;
  }
  *last_run = now;

  let cycle = reconcile_environment(core, environment);
  if tokio::time::timeout(CYCLE_TIMEOUT, cycle).await.is_err() {
    warn!(
      "health reconcile for {} exceeded {CYCLE_TIMEOUT:?}",
      environment.name
    );
  }
}

async fn reconcile_environment(
  core: &Arc<Core>,
  environment: &Environment,
) {
  let deployments = match core.store.deployments.list().await {
    Ok(deployments) => deployments
      .into_iter()
      .filter(|d| d.environment_id == environment.id)
      .collect::<Vec<_>>(),
    Err(e) => {
      error!(
        "failed to list deployments for reconcile | {} | {e:#}",
        environment.name
      );
      return;
    }
  };
  if deployments.is_empty() {
    return;
  }

  // A dead daemon degrades every sample to Unknown without
  // touching deployment state.
  let containers = match core.docker_for(environment).await {
    Ok(docker) => {
      match docker
        .list_containers(&[(
          labels::MANAGED.to_string(),
          String::from("true"),
        )])
        .await
      {
        Ok(containers) => {
          Some((docker, containers))
        }
        Err(e) => {
          debug!(
            "container listing failed on {} | {e:#}",
            environment.name
          );
          None
        }
      }
    }
    Err(e) => {
      debug!(
        "docker unreachable on {} | {e:#}",
        environment.name
      );
      None
    }
  };

  for deployment in deployments {
    let sample = match &containers {
      Some((docker, containers)) => {
        sample_deployment(
          core,
          docker,
          containers,
          &deployment,
        )
        .await
      }
      None => helpers::unknown_sample(&deployment),
    };
    record_sample(core, environment, &deployment, sample).await;
  }
}

/// Compute one health sample from the daemon's view of the
/// deployment's containers.
async fn sample_deployment(
  core: &Arc<Core>,
  docker: &Arc<dyn DockerApi>,
  containers: &[ContainerSummary],
  deployment: &Deployment,
) -> HealthState {
  let previous =
    core.monitor.last_samples.get(&deployment.id).await;

  let mut services = Vec::with_capacity(deployment.services.len());
  for instance in &deployment.services {
    let summary = containers.iter().find(|container| {
      container.labels.get(labels::DEPLOYMENT)
        == Some(&deployment.id)
        && container.labels.get(labels::SERVICE)
          == Some(&instance.service_name)
        // Exited init containers are not part of stack health.
        && !container.labels.contains_key(labels::INIT_ORDER)
    });
    let details: Option<ContainerDetails> = match summary {
      Some(summary) => {
        docker.inspect_container(&summary.name).await.ok()
      }
      None => None,
    };
    let prev = previous.as_ref().and_then(|p| {
      p.services
        .iter()
        .find(|s| s.service_name == instance.service_name)
    });
    services.push(derive_service_health(
      &instance.service_name,
      summary,
      details.as_ref(),
      prev,
    ));
  }

  let overall = derive_overall(&services);
  let mode = operation_mode(deployment);
  HealthState {
    deployment_id: deployment.id.clone(),
    overall_status: overall,
    operation_mode: mode,
    requires_attention: matches!(
      overall,
      StackHealthStatus::Unhealthy | StackHealthStatus::Degraded
    ) && !mode.suppresses_attention(),
    services,
    captured_at_utc: rsgo_timestamp(),
  }
}

/// Emit a change event when the sample differs from the previous
/// one, append it to the bounded history ring and refresh the
/// service container ids on the deployment record.
async fn record_sample(
  core: &Arc<Core>,
  environment: &Environment,
  deployment: &Deployment,
  sample: HealthState,
) {
  let previous =
    core.monitor.last_samples.get(&deployment.id).await;
  let changed = previous
    .as_ref()
    .map(|p| sample.differs_from(p))
    .unwrap_or(true);

  core
    .monitor
    .last_samples
    .insert(deployment.id.clone(), sample.clone())
    .await;

  if changed {
    core.bus.publish_health(sample.summarize(&environment.id));
  }

  let mut history = core
    .store
    .health_history
    .get(&deployment.id)
    .await
    .ok()
    .flatten()
    .unwrap_or_else(|| HealthHistory {
      deployment_id: deployment.id.clone(),
      samples: Vec::new(),
    });
  history
    .push(sample.clone(), core.config.health_history_samples);
  if let Err(e) = core
    .store
    .health_history
    .put(&deployment.id, &history)
    .await
  {
    warn!(
      "failed to append health history for {} | {e:#}",
      deployment.id
    );
  }

  refresh_container_ids(core, deployment, &sample).await;
}

/// Keep `services[].container_id` current within one reconcile.
/// Swaps are conditional and never fight a running operation.
async fn refresh_container_ids(
  core: &Arc<Core>,
  deployment: &Deployment,
  sample: &HealthState,
) {
  if deployment.in_flight() {
    return;
  }
  let mut updated = deployment.clone();
  let mut dirty = false;
  for instance in &mut updated.services {
    let observed = sample
      .services
      .iter()
      .find(|s| s.service_name == instance.service_name)
      .and_then(|s| s.container_id.clone());
    if observed.is_some() && instance.container_id != observed {
      instance.container_id = observed;
      dirty = true;
    }
  }
  if !dirty {
    return;
  }
  if let Err(e) = core
    .store
    .deployments
    .compare_and_swap(&deployment.id, deployment, &updated)
    .await
  {
    debug!(
      "container id refresh skipped for {} | {e:#}",
      deployment.id
    );
  }
}
