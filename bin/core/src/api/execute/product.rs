use resolver_api::Resolve;
use rsgo_client::{api::execute::*, entities::new_id};

use crate::{api::ExecuteArgs, product};

fn session_or_new(session_id: &str) -> String {
  if session_id.is_empty() {
    new_id()
  } else {
    session_id.to_string()
  }
}

impl Resolve<ExecuteArgs> for DeployProduct {
  #[instrument(name = "DeployProduct", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<ProductOpResponse> {
    Ok(
      product::deploy_product(
        args.core.clone(),
        product::ProductDeployArgs {
          environment: self.environment,
          product: self.product,
          stack_configs: self.stack_configs,
          shared_variables: self.shared_variables,
          continue_on_error: self.continue_on_error,
          session_id: session_or_new(&self.session_id),
        },
      )
      .await?,
    )
  }
}

impl Resolve<ExecuteArgs> for UpgradeProduct {
  #[instrument(name = "UpgradeProduct", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<ProductOpResponse> {
    Ok(
      product::upgrade_product(
        args.core.clone(),
        product::ProductUpgradeArgs {
          environment: self.environment,
          product_deployment: self.product_deployment,
          product: self.product,
          stack_configs: self.stack_configs,
          shared_variables: self.shared_variables,
          continue_on_error: self.continue_on_error,
          session_id: session_or_new(&self.session_id),
        },
      )
      .await?,
    )
  }
}

impl Resolve<ExecuteArgs> for RemoveProduct {
  #[instrument(name = "RemoveProduct", skip(args))]
  async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<ProductOpResponse> {
    Ok(
      product::remove_product(
        args.core.clone(),
        product::ProductRemoveArgs {
          environment: self.environment,
          product_deployment: self.product_deployment,
          continue_on_error: self.continue_on_error,
          session_id: session_or_new(&self.session_id),
        },
      )
      .await?,
    )
  }
}
