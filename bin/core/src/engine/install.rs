//! Install: `NotDeployed -> Installing -> Running | Failed`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use rsgo_client::entities::{
  deployment::{Deployment, DeploymentStatus, OperationKind},
  environment::{Environment, EnvironmentVariables},
  new_id,
  progress::ProgressPhase,
  rsgo_timestamp,
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
  OpCtx, OperationProgress, fail_deployment,
  init_containers::run_init_containers, network_name, pull_images,
  render_and_plan, stack_labels, start_services, volume_name,
};

pub struct InstallArgs {
  pub environment: String,
  pub stack_definition: String,
  pub stack_name: String,
  pub variables: HashMap<String, String>,
  pub attempt_id: String,
  /// Values shared across a product deploy, overlaid below the
  /// per-stack variables.
  pub shared_variables: HashMap<String, String>,
  pub product_deployment_id: Option<String>,
}

/// Validate, persist the new deployment in `Installing`, then
/// hand the phases to a spawned operation task. Returns as soon
/// as the operation is launched; completion is observed on the
/// session or the deployment status.
pub async fn launch_install(
  core: Arc<Core>,
  progress: OperationProgress,
  args: InstallArgs,
) -> ExecuteResult<(String, String, super::OpHandle)> {
  let session_id = progress.session_id.clone();
  let attempt_key = (!args.attempt_id.is_empty()).then(|| {
    format!(
      "install:{}:{}:{}",
      args.environment, args.stack_name, args.attempt_id
    )
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
    // The original task keeps running; hand back its session
    // with a settled handle.
    return Ok((
      attempt.deployment_id,
      attempt.session_id,
      tokio::spawn(async { Ok(()) }),
    ));
  }

  let environment = core.environment(&args.environment).await?;
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

  let existing = core
    .store
    .deployments
    .list()
    .await
    .map_err(ExecuteError::internal)?;
  if existing.iter().any(|d| {
    d.environment_id == environment.id
      && d.stack_name == args.stack_name
  }) {
    return Err(ExecuteError::validation(format!(
      "stack name {} already in use in environment {}",
      args.stack_name, environment.name
    )));
  }

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

  // Pre-flight: plan problems surface before any state exists.
  let (_, plan) = render_and_plan(&core, &definition, &resolved)?;

  let deployment = Deployment {
    id: new_id(),
    environment_id: environment.id.clone(),
    stack_definition_id: definition.id.clone(),
    stack_name: args.stack_name.clone(),
    status: DeploymentStatus::Installing,
    current_version: definition.version.clone(),
    configuration: crate::helpers::masked_configuration(
      &definition,
      &resolved,
    ),
    last_operation: Some(OperationKind::Install),
    product_deployment_id: args.product_deployment_id.clone(),
    ..Default::default()
  };
  core
    .store
    .deployments
    .insert_new(&deployment.id, &deployment)
    .await
    .map_err(ExecuteError::internal)?;

  let action_state = core
    .action_states
    .deployment
    .get_or_insert_default(&deployment.id)
    .await;
  let guard = action_state
    .update_owned(|state| state.installing = true)
    .map_err(|_| ExecuteError::OperationInProgress {
      deployment: deployment.id.clone(),
    })?;

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

  let deployment_id = deployment.id.clone();
  let handle = tokio::spawn(async move {
    let _guard = guard;
    let deployment_id = deployment.id.clone();
    let result = run_install(
      core.clone(),
      environment,
      deployment,
      definition,
      resolved,
      plan,
      progress.clone(),
    )
    .await;
    if let Err(error) = &result {
      fail_deployment(
        &core,
        &deployment_id,
        OperationKind::Install,
        ProgressPhase::Finalizing,
        error,
        &progress,
      )
      .await;
    }
    finish_attempt(&core, attempt_key).await;
    result
  });

  Ok((deployment_id, session_id, handle))
}

pub(super) async fn finish_attempt(
  core: &Core,
  attempt_key: Option<String>,
) {
  if let Some(key) = attempt_key
    && let Some(mut attempt) = core.attempts.get(&key).await
  {
    attempt.finished = true;
    core.attempts.insert(key, attempt).await;
  }
}

#[instrument(
  name = "Install",
  skip_all,
  fields(deployment_id = deployment.id, stack = deployment.stack_name)
)]
async fn run_install(
  core: Arc<Core>,
  environment: Environment,
  mut deployment: Deployment,
  definition: StackDefinition,
  resolved: HashMap<String, String>,
  plan: ServicePlan,
  progress: OperationProgress,
) -> ExecuteResult<()> {
  progress.set_totals(
    plan.services.len() as u64,
    plan.init_containers.len() as u64,
  );
  progress.enter(
    ProgressPhase::Preparing,
    format!("Preparing install of {}", deployment.stack_name),
  );

  let ctx = OpCtx::open(
    core.clone(),
    environment.clone(),
    progress.clone(),
    &deployment.id,
  )
  .await?;

  let result = install_phases(
    &ctx,
    &mut deployment,
    &definition,
    &resolved,
    &plan,
  )
  .await;
  ctx.close(&deployment.id).await;
  let services = result?;

  deployment.status = DeploymentStatus::Running;
  deployment.services = services;
  deployment.deployed_at = rsgo_timestamp();
  deployment.last_failure_reason = None;
  core.persist(&deployment).await?;

  // Persist the effective variable set for future deploys
  // in this environment.
  core
    .store
    .env_variables
    .put(
      &environment.id,
      &EnvironmentVariables {
        environment_id: environment.id.clone(),
        variables: resolved,
      },
    )
    .await
    .map_err(ExecuteError::internal)?;

  progress.complete(format!(
    "Stack {} installed",
    deployment.stack_name
  ));
  info!(
    "installed {} in environment {}",
    deployment.stack_name, environment.name
  );
  Ok(())
}

async fn install_phases(
  ctx: &OpCtx,
  deployment: &mut Deployment,
  definition: &StackDefinition,
  resolved: &HashMap<String, String>,
  plan: &ServicePlan,
) -> ExecuteResult<Vec<rsgo_client::entities::deployment::ServiceInstance>>
{
  // A placeholder pre-upgrade snapshot with empty previous
  // state, so a failed install lands in a clean Failed.
  ctx
    .core
    .snapshots
    .capture(Snapshot {
      deployment_id: deployment.id.clone(),
      kind: SnapshotKind::PreUpgrade,
      target_version: String::new(),
      resolved_variables: resolved.clone(),
      description: Some(String::from("pre-install")),
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
    format!("Starting {} services", plan.services.len()),
  );
  let services = start_services(
    ctx,
    deployment,
    &definition.version,
    plan,
    Vec::new(),
  )
  .await?;

  ctx.progress.enter(
    ProgressPhase::Finalizing,
    String::from("Verifying services"),
  );
  Ok(services)
}

/// Stack-owned network and named volumes, labeled for later
/// correlation and removal.
pub(super) async fn prepare_stack_resources(
  ctx: &OpCtx,
  deployment: &Deployment,
  definition: &StackDefinition,
  plan: &ServicePlan,
) -> ExecuteResult<()> {
  let labels = stack_labels(deployment, &definition.version, None);
  let network = network_name(&deployment.stack_name);
  let existing_networks = ctx
    .docker
    .list_networks(&super::deployment_filter(&deployment.id))
    .await
    .map_err(ExecuteError::internal)?;
  if !existing_networks.contains(&network) {
    ctx
      .docker
      .create_network(&network, labels.clone())
      .await
      .map_err(ExecuteError::internal)?;
  }
  for volume in &plan.volumes {
    ctx
      .docker
      .create_volume(
        &volume_name(&deployment.stack_name, volume),
        labels.clone(),
      )
      .await
      .map_err(ExecuteError::internal)?;
  }
  Ok(())
}
