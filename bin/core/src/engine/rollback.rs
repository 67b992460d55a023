//! Rollback: `Failed -> RollingBack -> Running | Failed`, driven
//! entirely from the pre-upgrade snapshot. Images are pulled by
//! their recorded digests for a bit-identical restore.

use std::{sync::Arc, time::Duration};

use rsgo_client::entities::{
  deployment::{Deployment, DeploymentStatus, OperationKind},
  environment::Environment,
  progress::ProgressPhase,
  snapshot::Snapshot,
};

use crate::{
  error::{ExecuteError, ExecuteResult},
  plan::ServicePlan,
  state::{AttemptRecord, Core},
};

use super::{
  OpCtx, OperationProgress, container_name, fail_deployment,
  init_containers::run_init_containers, install::finish_attempt,
  pull_images, start_services,
};

pub struct RollbackArgs {
  pub environment: String,
  pub deployment: String,
  pub attempt_id: String,
}

pub async fn launch_rollback(
  core: Arc<Core>,
  progress: OperationProgress,
  args: RollbackArgs,
) -> ExecuteResult<(String, super::OpHandle)> {
  let session_id = progress.session_id.clone();
  let attempt_key = (!args.attempt_id.is_empty()).then(|| {
    format!("rollback:{}:{}", args.deployment, args.attempt_id)
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
  if !core
    .snapshots
    .can_rollback(&deployment)
    .await
    .map_err(ExecuteError::internal)?
  {
    if deployment.status != DeploymentStatus::Failed
      || deployment.last_operation != Some(OperationKind::Upgrade)
    {
      return Err(ExecuteError::InvalidState(format!(
        "rollback requires a failed upgrade, deployment is {} after {:?}",
        deployment.status, deployment.last_operation
      )));
    }
    return Err(ExecuteError::NoSnapshot);
  }
  let snapshot = core
    .snapshots
    .restore(&deployment.id)
    .await
    .map_err(ExecuteError::internal)?
    .ok_or(ExecuteError::NoSnapshot)?;

  // Re-render the captured template with the captured values.
  let compose = variables::Renderer::new(
    &snapshot.resolved_variables,
  )
  .render(&snapshot.compose_template)
  .map_err(|e| ExecuteError::validation(e.to_string()))?;
  let plan = crate::plan::plan(
    &compose,
    &core.config.allowed_volume_roots,
  )
  .map_err(|e| ExecuteError::PlanInvalid(e.to_string()))?;

  let action_state = core
    .action_states
    .deployment
    .get_or_insert_default(&deployment.id)
    .await;
  let guard = action_state
    .update_owned(|state| state.rolling_back = true)
    .map_err(|_| ExecuteError::OperationInProgress {
      deployment: deployment.id.clone(),
    })?;

  let deployment = core
    .transition(&deployment, |d| {
      d.status = DeploymentStatus::RollingBack;
      d.last_operation = Some(OperationKind::Rollback);
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
    let deployment_id = deployment.id.clone();
    let result = run_rollback(
      core.clone(),
      environment,
      deployment,
      snapshot,
      plan,
      progress.clone(),
    )
    .await;
    if let Err(error) = &result {
      fail_deployment(
        &core,
        &deployment_id,
        OperationKind::Rollback,
        ProgressPhase::Finalizing,
        error,
        &progress,
      )
      .await;
    }
    finish_attempt(&core, attempt_key).await;
    result
  });

  Ok((session_id, handle))
}

#[instrument(
  name = "Rollback",
  skip_all,
  fields(deployment_id = deployment.id, stack = deployment.stack_name)
)]
async fn run_rollback(
  core: Arc<Core>,
  environment: Environment,
  mut deployment: Deployment,
  snapshot: Snapshot,
  plan: ServicePlan,
  progress: OperationProgress,
) -> ExecuteResult<()> {
  progress.set_totals(
    plan.services.len() as u64,
    plan.init_containers.len() as u64,
  );
  progress.enter(
    ProgressPhase::Preparing,
    format!(
      "Rolling {} back to {}",
      deployment.stack_name, snapshot.target_version
    ),
  );

  let ctx = OpCtx::open(
    core.clone(),
    environment.clone(),
    progress.clone(),
    &deployment.id,
  )
  .await?;

  let result =
    rollback_phases(&ctx, &mut deployment, &snapshot, &plan).await;
  ctx.close(&deployment.id).await;
  let services = result?;

  deployment.status = DeploymentStatus::Running;
  deployment.services = services;
  deployment.current_version = snapshot.target_version.clone();
  deployment.deployed_at =
    rsgo_client::entities::rsgo_timestamp();
  deployment.last_failure_reason = None;
  core.persist(&deployment).await?;

  progress.complete(format!(
    "Stack {} rolled back to {}",
    deployment.stack_name, snapshot.target_version
  ));
  Ok(())
}

async fn rollback_phases(
  ctx: &OpCtx,
  deployment: &mut Deployment,
  snapshot: &Snapshot,
  plan: &ServicePlan,
) -> ExecuteResult<Vec<rsgo_client::entities::deployment::ServiceInstance>>
{
  let images = plan.images();
  ctx.progress.enter(
    ProgressPhase::PullingImages,
    format!("Pulling {} images by digest", images.len()),
  );
  ctx
    .phase(
      Duration::from_secs(ctx.core.config.pull_timeout_secs),
      || ExecuteError::ImagePullFailed {
        image: images.join(", "),
        cause: String::from("image pull phase deadline exceeded"),
      },
      pull_images(ctx, &images, Some(&snapshot.image_digests)),
    )
    .await?;

  ctx.progress.enter(
    ProgressPhase::InitializingContainers,
    format!(
      "Running {} init containers",
      plan.init_containers.len()
    ),
  );
  ctx
    .phase(
      Duration::from_secs(ctx.core.config.init_timeout_secs),
      || {
        ExecuteError::internal(anyhow::anyhow!(
          "init container phase deadline exceeded"
        ))
      },
      run_init_containers(
        ctx,
        deployment,
        &snapshot.target_version,
        plan,
      ),
    )
    .await?;

  // The failed upgrade may have left any mix of old and new
  // containers. Recreate every service from the snapshot.
  ctx.progress.enter(
    ProgressPhase::StartingServices,
    String::from("Recreating services from snapshot"),
  );
  for instance in &deployment.services {
    let name = container_name(
      &deployment.stack_name,
      &instance.service_name,
    );
    if let Err(e) = ctx
      .docker
      .stop_container(&name, ctx.core.config.stop_grace_secs)
      .await
    {
      debug!("stop {name} during rollback | {e:#}");
    }
    if let Err(e) = ctx.docker.remove_container(&name, true).await
    {
      debug!("remove {name} during rollback | {e:#}");
    }
  }
  let services = start_services(
    ctx,
    deployment,
    &snapshot.target_version,
    plan,
    Vec::new(),
  )
  .await?;

  // Finalizing for a rollback includes the health re-check done
  // by start_services' settle wait.
  ctx.progress.enter(
    ProgressPhase::Finalizing,
    String::from("Verifying restored services"),
  );
  Ok(services)
}
