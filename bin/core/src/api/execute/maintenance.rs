use resolver_api::Resolve;
use rsgo_client::{
  api::execute::{EnterMaintenance, ExitMaintenance},
  entities::NoData,
};

use crate::{api::ExecuteArgs, error::ExecuteError, state::Core};

async fn set_maintenance(
  core: &Core,
  environment_id: &str,
  deployment_id: &str,
  maintenance: bool,
) -> serror::Result<NoData> {
  let environment = core.environment(environment_id).await?;
  let deployment = core.deployment(deployment_id).await?;
  if deployment.environment_id != environment.id {
    return Err(
      ExecuteError::not_found("Deployment", deployment_id).into(),
    );
  }
  if deployment.in_flight() {
    return Err(
      ExecuteError::InvalidState(format!(
        "cannot toggle maintenance while deployment is {}",
        deployment.status
      ))
      .into(),
    );
  }
  if deployment.maintenance == maintenance {
    return Ok(NoData {});
  }
  core
    .transition(&deployment, |d| d.maintenance = maintenance)
    .await?;
  Ok(NoData {})
}

impl Resolve<ExecuteArgs> for EnterMaintenance {
  #[instrument(name = "EnterMaintenance", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<NoData> {
    set_maintenance(
      &args.core,
      &self.environment,
      &self.deployment,
      true,
    )
    .await
  }
}

impl Resolve<ExecuteArgs> for ExitMaintenance {
  #[instrument(name = "ExitMaintenance", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<NoData> {
    set_maintenance(
      &args.core,
      &self.environment,
      &self.deployment,
      false,
    )
    .await
  }
}
