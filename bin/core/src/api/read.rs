use resolver_api::Resolve;
use rsgo_client::{
  api::read::*,
  entities::{deployment::Deployment, snapshot::Snapshot},
};

use crate::{api::ReadArgs, error::ExecuteError, monitor};

impl Resolve<ReadArgs> for GetStackHealth {
  #[instrument(name = "GetStackHealth", skip(args))]
  async fn resolve(
    self,
    args: &ReadArgs,
  ) -> serror::Result<StackHealthDto> {
    let core = &args.core;
    let environment = core.environment(&self.environment).await?;
    let deployment = core.deployment(&self.deployment).await?;
    if deployment.environment_id != environment.id {
      return Err(
        ExecuteError::not_found("Deployment", &self.deployment)
          .into(),
      );
    }

    if self.force_refresh
      || core
        .monitor
        .last_samples
        .get(&deployment.id)
        .await
        .is_none()
    {
      monitor::update_health_for_environment(
        core,
        &environment,
        true,
      )
      .await;
    }

    let state = core
      .monitor
      .last_samples
      .get(&deployment.id)
      .await
      .unwrap_or_else(|| monitor::unknown_sample(&deployment));
    let summary = state.summarize(&environment.id);
    Ok(StackHealthDto { state, summary })
  }
}

impl Resolve<ReadArgs> for GetDeployment {
  #[instrument(name = "GetDeployment", skip(args))]
  async fn resolve(
    self,
    args: &ReadArgs,
  ) -> serror::Result<Deployment> {
    Ok(args.core.deployment(&self.deployment).await?)
  }
}

impl Resolve<ReadArgs> for ListDeployments {
  #[instrument(name = "ListDeployments", skip(args))]
  async fn resolve(
    self,
    args: &ReadArgs,
  ) -> serror::Result<Vec<Deployment>> {
    let mut deployments = args
      .core
      .store
      .deployments
      .list()
      .await
      .map_err(ExecuteError::internal)?;
    if !self.environment.is_empty() {
      deployments
        .retain(|d| d.environment_id == self.environment);
    }
    deployments.sort_by(|a, b| a.stack_name.cmp(&b.stack_name));
    Ok(deployments)
  }
}

impl Resolve<ReadArgs> for ListSnapshots {
  #[instrument(name = "ListSnapshots", skip(args))]
  async fn resolve(
    self,
    args: &ReadArgs,
  ) -> serror::Result<Vec<Snapshot>> {
    Ok(
      args
        .core
        .snapshots
        .list_for(&self.deployment)
        .await
        .map_err(ExecuteError::internal)?,
    )
  }
}

impl Resolve<ReadArgs> for CanRollback {
  #[instrument(name = "CanRollback", skip(args))]
  async fn resolve(
    self,
    args: &ReadArgs,
  ) -> serror::Result<CanRollbackResponse> {
    let deployment =
      args.core.deployment(&self.deployment).await?;
    let eligible = args
      .core
      .snapshots
      .can_rollback(&deployment)
      .await
      .map_err(ExecuteError::internal)?;
    Ok(CanRollbackResponse { eligible })
  }
}
