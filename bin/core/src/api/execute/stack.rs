use resolver_api::Resolve;
use rsgo_client::{
  api::execute::*,
  entities::{
    NoData,
    deployment::{DeploymentStatus, OperationKind},
    new_id,
  },
};

use crate::{
  api::ExecuteArgs,
  engine::{
    self, OperationProgress, launch_install, launch_remove,
    launch_rollback, launch_upgrade,
  },
  error::ExecuteError,
};

fn session_or_new(session_id: &str) -> String {
  if session_id.is_empty() {
    new_id()
  } else {
    session_id.to_string()
  }
}

impl Resolve<ExecuteArgs> for DeployStack {
  #[instrument(name = "DeployStack", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<DeployStackResponse> {
    let core = &args.core;
    let progress = OperationProgress::new(
      core.bus.clone(),
      session_or_new(&self.session_id),
    );
    let (deployment_id, session_id, _handle) = launch_install(
      core.clone(),
      progress,
      engine::install::InstallArgs {
        environment: self.environment,
        stack_definition: self.stack_definition,
        stack_name: self.stack_name,
        variables: self.variables,
        attempt_id: self.attempt_id,
        shared_variables: Default::default(),
        product_deployment_id: None,
      },
    )
    .await?;
    Ok(DeployStackResponse {
      deployment_id,
      session_id,
    })
  }
}

impl Resolve<ExecuteArgs> for UpgradeStack {
  #[instrument(name = "UpgradeStack", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<StackOpResponse> {
    let core = &args.core;
    let progress = OperationProgress::new(
      core.bus.clone(),
      session_or_new(&self.session_id),
    );
    let (session_id, _handle) = launch_upgrade(
      core.clone(),
      progress,
      engine::upgrade::UpgradeArgs {
        environment: self.environment,
        deployment: self.deployment,
        stack_definition: self.stack_definition,
        variables: self.variables,
        attempt_id: self.attempt_id,
        shared_variables: Default::default(),
      },
    )
    .await?;
    Ok(StackOpResponse { session_id })
  }
}

impl Resolve<ExecuteArgs> for RollbackStack {
  #[instrument(name = "RollbackStack", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<StackOpResponse> {
    let core = &args.core;
    let progress = OperationProgress::new(
      core.bus.clone(),
      session_or_new(&self.session_id),
    );
    let (session_id, _handle) = launch_rollback(
      core.clone(),
      progress,
      engine::rollback::RollbackArgs {
        environment: self.environment,
        deployment: self.deployment,
        attempt_id: self.attempt_id,
      },
    )
    .await?;
    Ok(StackOpResponse { session_id })
  }
}

impl Resolve<ExecuteArgs> for RemoveStack {
  #[instrument(name = "RemoveStack", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<StackOpResponse> {
    let core = &args.core;
    let progress = OperationProgress::new(
      core.bus.clone(),
      session_or_new(&self.session_id),
    );
    let (session_id, _handle) = launch_remove(
      core.clone(),
      progress,
      engine::remove::RemoveArgs {
        environment: self.environment,
        deployment: self.deployment,
        attempt_id: self.attempt_id,
      },
    )
    .await?;
    Ok(StackOpResponse { session_id })
  }
}

impl Resolve<ExecuteArgs> for MarkAsFailed {
  #[instrument(name = "MarkAsFailed", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<NoData> {
    let core = &args.core;
    let environment = core.environment(&self.environment).await?;
    let deployment = core.deployment(&self.deployment).await?;
    if deployment.environment_id != environment.id {
      return Err(
        ExecuteError::not_found("Deployment", &self.deployment)
          .into(),
      );
    }
    if !matches!(
      deployment.status,
      DeploymentStatus::Installing | DeploymentStatus::Upgrading
    ) {
      return Err(
        ExecuteError::InvalidState(format!(
          "MarkAsFailed applies to Installing or Upgrading, deployment is {}",
          deployment.status
        ))
        .into(),
      );
    }

    // Stop the wedged operation task, if one is still running
    // in this process.
    if let Some(cancel) =
      core.operations.get(&deployment.id).await
    {
      cancel.cancel();
    }

    let operation = match deployment.status {
      DeploymentStatus::Installing => OperationKind::Install,
      _ => OperationKind::Upgrade,
    };
    core
      .transition(&deployment, |d| {
        d.status = DeploymentStatus::Failed;
        d.last_operation = Some(operation);
        d.last_failure_reason = Some(self.reason.clone());
      })
      .await?;
    warn!(
      "deployment {} marked Failed by operator: {}",
      deployment.stack_name, self.reason
    );
    Ok(NoData {})
  }
}
