//! Remove: `Running | Failed -> Removing -> Removed` (record
//! deleted). Services stop in reverse dependency order; only
//! stack-owned networks and volumes are deleted.

use std::sync::Arc;

use rsgo_client::entities::{
  deployment::{Deployment, DeploymentStatus, OperationKind},
  environment::Environment,
  progress::ProgressPhase,
};

use crate::{
  error::{ExecuteError, ExecuteResult},
  state::{AttemptRecord, Core},
};

use super::{
  OpCtx, OperationProgress, container_name, deployment_filter,
  install::finish_attempt, network_name,
};

pub struct RemoveArgs {
  pub environment: String,
  pub deployment: String,
  pub attempt_id: String,
}

pub async fn launch_remove(
  core: Arc<Core>,
  progress: OperationProgress,
  args: RemoveArgs,
) -> ExecuteResult<(String, super::OpHandle)> {
  let session_id = progress.session_id.clone();
  let attempt_key = (!args.attempt_id.is_empty()).then(|| {
    format!("remove:{}:{}", args.deployment, args.attempt_id)
  });
  if let Some(key) = &attempt_key
    && let Some(attempt) = core.attempts.get(key).await
  {
    if attempt.finished {
      return Err(ExecuteError::validation(format!(
        "attempt {} already completed",
        args.attempt_id
      )));
    }
    return Ok((
      attempt.session_id,
      tokio::spawn(async { Ok(()) }),
    ));
  }

  let environment = core.environment(&args.environment).await?;
  let deployment = core.deployment(&args.deployment).await?;
  if deployment.environment_id != environment.id {
    return Err(ExecuteError::not_found(
      "Deployment",
      &args.deployment,
    ));
  }
  if !matches!(
    deployment.status,
    DeploymentStatus::Running | DeploymentStatus::Failed
  ) {
    return Err(ExecuteError::InvalidState(format!(
      "remove requires Running or Failed, deployment is {}",
      deployment.status
    )));
  }

  let action_state = core
    .action_states
    .deployment
    .get_or_insert_default(&deployment.id)
    .await;
  let guard = action_state
    .update_owned(|state| state.removing = true)
    .map_err(|_| ExecuteError::OperationInProgress {
      deployment: deployment.id.clone(),
    })?;

  let deployment = core
    .transition(&deployment, |d| {
      d.status = DeploymentStatus::Removing;
      d.last_operation = Some(OperationKind::Remove);
    })
    .await?;

  if let Some(key) = &attempt_key {
    core
      .attempts
      .insert(
        key.clone(),
        AttemptRecord {
          deployment_id: deployment.id.clone(),
          session_id: session_id.clone(),
          finished: false,
        },
      )
      .await;
  }

  let handle = tokio::spawn(async move {
    let _guard = guard;
    let result = run_remove(
      core.clone(),
      environment,
      deployment,
      progress.clone(),
    )
    .await;
    if let Err(error) = &result {
      // A live remove failure leaves the record in `Removing`;
      // only the recovery sweep of a dead process moves it to
      // `Failed`. The caller gets the per-service outcomes on
      // the terminal event and the returned error.
      progress.fail(ProgressPhase::Finalizing, error);
    }
    finish_attempt(&core, attempt_key).await;
    result
  });

  Ok((session_id, handle))
}

#[instrument(
  name = "Remove",
  skip_all,
  fields(deployment_id = deployment.id, stack = deployment.stack_name)
)]
async fn run_remove(
  core: Arc<Core>,
  environment: Environment,
  deployment: Deployment,
  progress: OperationProgress,
) -> ExecuteResult<()> {
  progress
    .set_totals(deployment.services.len() as u64, 0);
  progress.enter(
    ProgressPhase::Preparing,
    format!("Removing stack {}", deployment.stack_name),
  );

  let ctx = OpCtx::open(
    core.clone(),
    environment,
    progress.clone(),
    &deployment.id,
  )
  .await?;
  let result = remove_all(&ctx, &deployment).await;
  ctx.close(&deployment.id).await;
  let failed = result?;

  if !failed.is_empty() {
    return Err(ExecuteError::InvalidState(format!(
      "failed to remove services: {}",
      failed.join(", ")
    )));
  }

  core
    .snapshots
    .delete_for(&deployment.id)
    .await
    .map_err(ExecuteError::internal)?;
  core
    .store
    .health_history
    .delete(&deployment.id)
    .await
    .map_err(ExecuteError::internal)?;
  core
    .store
    .deployments
    .delete(&deployment.id)
    .await
    .map_err(ExecuteError::internal)?;

  progress.complete(format!(
    "Stack {} removed",
    deployment.stack_name
  ));
  info!("removed stack {}", deployment.stack_name);
  Ok(())
}

/// Stop and remove every service container (reverse start order),
/// then the stack network and owned volumes. Returns the names of
/// services that could not be removed.
async fn remove_all(
  ctx: &OpCtx,
  deployment: &Deployment,
) -> ExecuteResult<Vec<String>> {
  let total = deployment.services.len() as u64;
  let mut failed = Vec::new();

  for (index, instance) in
    deployment.services.iter().rev().enumerate()
  {
    let service = &instance.service_name;
    let name =
      container_name(&deployment.stack_name, service);
    ctx.progress.step(
      ProgressPhase::StartingServices,
      format!("Stopping service {service}"),
      Some(service),
      index as u64,
      total,
    );
    if let Err(e) = ctx
      .docker
      .stop_container(&name, ctx.core.config.stop_grace_secs)
      .await
    {
      debug!("graceful stop of {name} failed, killing | {e:#}");
      if let Err(e) = ctx.docker.kill_container(&name).await {
        debug!("kill {name} | {e:#}");
      }
    }
    if let Err(e) =
      ctx.docker.remove_container(&name, true).await
    {
      warn!("failed to remove container {name} | {e:#}");
      failed.push(service.clone());
      continue;
    }
    ctx.progress.step(
      ProgressPhase::StartingServices,
      format!("Service {service} removed"),
      Some(service),
      index as u64 + 1,
      total,
    );
  }

  // Init containers (and anything else owned by the deployment)
  // are matched by label rather than the service list.
  match ctx
    .docker
    .list_containers(&deployment_filter(&deployment.id))
    .await
  {
    Ok(leftovers) => {
      for container in leftovers {
        if let Err(e) = ctx
          .docker
          .remove_container(&container.name, true)
          .await
        {
          warn!(
            "failed to remove container {} | {e:#}",
            container.name
          );
        }
      }
    }
    Err(e) => {
      warn!("failed to list leftover containers | {e:#}")
    }
  }

  if !failed.is_empty() {
    return Ok(failed);
  }

  ctx.progress.enter(
    ProgressPhase::Finalizing,
    String::from("Removing stack network and volumes"),
  );
  if let Err(e) = ctx
    .docker
    .remove_network(&network_name(&deployment.stack_name))
    .await
  {
    debug!("remove stack network | {e:#}");
  }
  match ctx
    .docker
    .list_volumes(&deployment_filter(&deployment.id))
    .await
  {
    Ok(volumes) => {
      for volume in volumes {
        if let Err(e) = ctx.docker.remove_volume(&volume).await {
          warn!("failed to remove volume {volume} | {e:#}");
        }
      }
    }
    Err(e) => warn!("failed to list stack volumes | {e:#}"),
  }

  Ok(failed)
}
