//! Upgrade: `Running -> Upgrading -> Running | Failed`, with a
//! pre-upgrade snapshot and a recreate-changed-services strategy.

use std::{collections::HashMap, sync::Arc, time::Duration};

use rsgo_client::entities::{
  deployment::{Deployment, DeploymentStatus, OperationKind},
  environment::Environment,
  progress::ProgressPhase,
  snapshot::{Snapshot, SnapshotKind},
  source::StackDefinition,
};
use variables::layered_values;

use crate::{
  error::{ExecuteError, ExecuteResult},
  plan::ServicePlan,
  state::{AttemptRecord, Core},
};

use super::{
  OpCtx, OperationProgress, container_name, fail_deployment,
  init_containers::run_init_containers,
  install::{finish_attempt, prepare_stack_resources},
  pull_images, read_image_digests, render_and_plan,
  start_services,
};

pub struct UpgradeArgs {
  pub environment: String,
  pub deployment: String,
  pub stack_definition: String,
  pub variables: HashMap<String, String>,
  pub attempt_id: String,
  pub shared_variables: HashMap<String, String>,
}

pub async fn launch_upgrade(
  core: Arc<Core>,
  progress: OperationProgress,
  args: UpgradeArgs,
) -> ExecuteResult<(String, super::OpHandle)> {
  let session_id = progress.session_id.clone();
  let attempt_key = (!args.attempt_id.is_empty()).then(|| {
    format!("upgrade:{}:{}", args.deployment, args.attempt_id)
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
  if deployment.status != DeploymentStatus::Running {
    return Err(ExecuteError::InvalidState(format!(
      "upgrade requires Running, deployment is {}",
      deployment.status
    )));
  }

  let definition = core
    .store
    .stack_definitions
    .get(&args.stack_definition)
    .await
    .map_err(ExecuteError::internal)?
    .ok_or_else(|| {
      ExecuteError::not_found(
        "StackDefinition",
        &args.stack_definition,
      )
    })?;

  let stored = core
    .store
    .env_variables
    .get(&environment.id)
    .await
    .map_err(ExecuteError::internal)?
    .unwrap_or_default();
  let resolved = layered_values(
    &definition.default_values(),
    &stored.variables,
    &args.shared_variables,
    &args.variables,
  );

  // The planner must accept the new compose before any state
  // changes.
  let (_, plan) = render_and_plan(&core, &definition, &resolved)?;

  // The state of the running stack, for the snapshot and the
  // recreate diff.
  let old_definition = core
    .store
    .stack_definitions
    .get(&deployment.stack_definition_id)
    .await
    .map_err(ExecuteError::internal)?;
  let old_state = old_definition.and_then(|old_definition| {
    let old_resolved = layered_values(
      &old_definition.default_values(),
      &stored.variables,
      &HashMap::new(),
      &HashMap::new(),
    );
    render_and_plan(&core, &old_definition, &old_resolved)
      .ok()
      .map(|(_, old_plan)| {
        (old_definition, old_resolved, old_plan)
      })
  });

  let action_state = core
    .action_states
    .deployment
    .get_or_insert_default(&deployment.id)
    .await;
  let guard = action_state
    .update_owned(|state| state.upgrading = true)
    .map_err(|_| ExecuteError::OperationInProgress {
      deployment: deployment.id.clone(),
    })?;

  let deployment = core
    .transition(&deployment, |d| {
      d.status = DeploymentStatus::Upgrading;
      d.last_operation = Some(OperationKind::Upgrade);
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
    let result = run_upgrade(
      core.clone(),
      environment,
      deployment,
      definition,
      resolved,
      plan,
      old_state,
      progress.clone(),
    )
    .await;
    if let Err(error) = &result {
      fail_deployment(
        &core,
        &deployment_id,
        OperationKind::Upgrade,
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

type OldState =
  (StackDefinition, HashMap<String, String>, ServicePlan);

#[instrument(
  name = "Upgrade",
  skip_all,
  fields(deployment_id = deployment.id, stack = deployment.stack_name)
)]
#[allow(clippy::too_many_arguments)]
async fn run_upgrade(
  core: Arc<Core>,
  environment: Environment,
  mut deployment: Deployment,
  definition: StackDefinition,
  resolved: HashMap<String, String>,
  plan: ServicePlan,
  old_state: Option<OldState>,
  progress: OperationProgress,
) -> ExecuteResult<()> {
  progress.set_totals(
    plan.services.len() as u64,
    plan.init_containers.len() as u64,
  );
  progress.enter(
    ProgressPhase::Preparing,
    format!("Preparing upgrade of {}", deployment.stack_name),
  );

  let ctx = OpCtx::open(
    core.clone(),
    environment.clone(),
    progress.clone(),
    &deployment.id,
  )
  .await?;

  let result = upgrade_phases(
    &ctx,
    &mut deployment,
    &definition,
    &resolved,
    &plan,
    old_state,
  )
  .await;
  ctx.close(&deployment.id).await;
  let services = result?;

  deployment.status = DeploymentStatus::Running;
  deployment.services = services;
  deployment.stack_definition_id = definition.id.clone();
  deployment.current_version = definition.version.clone();
  deployment.configuration =
    crate::helpers::masked_configuration(&definition, &resolved);
  deployment.upgrade_count += 1;
  deployment.deployed_at =
    rsgo_client::entities::rsgo_timestamp();
  deployment.last_failure_reason = None;
  core.persist(&deployment).await?;

  core
    .store
    .env_variables
    .put(
      &environment.id,
      &rsgo_client::entities::environment::EnvironmentVariables {
        environment_id: environment.id.clone(),
        variables: resolved.clone(),
      },
    )
    .await
    .map_err(ExecuteError::internal)?;

  // Supersede the pre-change snapshot with one representing the
  // now-current state, the rollback target of the next upgrade.
  let digests =
    read_image_digests(&core.docker_for(&environment).await?, &plan.images())
      .await;
  core
    .snapshots
    .capture(Snapshot {
      deployment_id: deployment.id.clone(),
      kind: SnapshotKind::PreUpgrade,
      compose_template: definition.compose_template.clone(),
      resolved_variables: resolved,
      image_digests: digests,
      target_version: definition.version.clone(),
      description: Some(format!(
        "state after upgrade to {}",
        definition.version
      )),
      ..Default::default()
    })
    .await
    .map_err(ExecuteError::internal)?;

  progress.complete(format!(
    "Stack {} upgraded to {}",
    deployment.stack_name, definition.version
  ));
  Ok(())
}

async fn upgrade_phases(
  ctx: &OpCtx,
  deployment: &mut Deployment,
  definition: &StackDefinition,
  resolved: &HashMap<String, String>,
  plan: &ServicePlan,
  old_state: Option<OldState>,
) -> ExecuteResult<Vec<rsgo_client::entities::deployment::ServiceInstance>>
{
  // Snapshot the pre-change state before any mutating call.
  let current_images = deployment
    .services
    .iter()
    .map(|s| s.image.clone())
    .collect::<Vec<_>>();
  let image_digests =
    read_image_digests(&ctx.docker, &current_images).await;
  let (snapshot_compose, snapshot_variables) = match &old_state {
    Some((old_definition, old_resolved, _)) => (
      old_definition.compose_template.clone(),
      old_resolved.clone(),
    ),
    None => (String::new(), HashMap::new()),
  };
  ctx
    .core
    .snapshots
    .capture(Snapshot {
      deployment_id: deployment.id.clone(),
      kind: SnapshotKind::PreUpgrade,
      compose_template: snapshot_compose,
      resolved_variables: snapshot_variables,
      image_digests,
      target_version: deployment.current_version.clone(),
      description: Some(format!(
        "before upgrade to {}",
        definition.version
      )),
      ..Default::default()
    })
    .await
    .map_err(ExecuteError::internal)?;

  let images = plan.images();
  ctx.progress.enter(
    ProgressPhase::PullingImages,
    format!("Pulling {} images", images.len()),
  );
  ctx
    .phase(
      Duration::from_secs(ctx.core.config.pull_timeout_secs),
      || ExecuteError::ImagePullFailed {
        image: images.join(", "),
        cause: String::from("image pull phase deadline exceeded"),
      },
      pull_images(ctx, &images, None),
    )
    .await?;

  ctx.progress.enter(
    ProgressPhase::InitializingContainers,
    format!(
      "Running {} init containers",
      plan.init_containers.len()
    ),
  );
  prepare_stack_resources(ctx, deployment, definition, plan)
    .await?;
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
        &definition.version,
        plan,
      ),
    )
    .await?;

  ctx.progress.enter(
    ProgressPhase::StartingServices,
    String::from("Recreating changed services"),
  );
  let untouched = recreate_changed(
    ctx,
    deployment,
    plan,
    old_state.as_ref().map(|(_, _, old_plan)| old_plan),
  )
  .await?;
  let services = start_services(
    ctx,
    deployment,
    &definition.version,
    plan,
    untouched,
  )
  .await?;

  ctx.progress.enter(
    ProgressPhase::Finalizing,
    String::from("Verifying services"),
  );
  Ok(services)
}

/// Stop and remove containers whose definition changed (or that
/// no longer exist in the new plan), returning the instances left
/// untouched.
async fn recreate_changed(
  ctx: &OpCtx,
  deployment: &Deployment,
  plan: &ServicePlan,
  old_plan: Option<&ServicePlan>,
) -> ExecuteResult<
  Vec<rsgo_client::entities::deployment::ServiceInstance>,
> {
  let mut untouched = Vec::new();
  for instance in &deployment.services {
    let keep = match (
      plan.service(&instance.service_name),
      old_plan.and_then(|p| p.service(&instance.service_name)),
    ) {
      (Some(new_node), Some(old_node)) => {
        new_node.image == old_node.image
          && new_node.env == old_node.env
      }
      // Without the old plan, a matching image is the best
      // unchanged signal available.
      (Some(new_node), None) => new_node.image == instance.image,
      // Service dropped from the stack.
      (None, _) => false,
    };
    if keep {
      untouched.push(instance.clone());
      continue;
    }
    let name = container_name(
      &deployment.stack_name,
      &instance.service_name,
    );
    if let Err(e) = ctx
      .docker
      .stop_container(
        &name,
        ctx.core.config.stop_grace_secs,
      )
      .await
    {
      debug!("stop {name} before recreate | {e:#}");
    }
    if let Err(e) = ctx.docker.remove_container(&name, true).await
    {
      debug!("remove {name} before recreate | {e:#}");
    }
  }
  Ok(untouched)
}
