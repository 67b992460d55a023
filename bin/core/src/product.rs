//! The product orchestrator: runs an operation across the stacks
//! of a product, strictly sequentially in declared order (reverse
//! for removal), compressing each stack's phase bands into its
//! slot of the overall progress.

use std::{collections::HashMap, sync::Arc};

use rsgo_client::entities::{
  deployment::{ProductDeployment, ProductDeploymentStatus},
  new_id,
  progress::{ProgressEvent, ProgressPhase},
  source::{StackDefinition, VariableKind},
};

use rsgo_client::api::execute::{
  ProductOpResponse, ProductStackConfig, ProductStackResult,
};

use crate::{
  engine::{
    self, OperationProgress,
    launch_install, launch_remove, launch_upgrade,
  },
  error::{ExecuteError, ExecuteResult},
  state::Core,
};

pub struct ProductDeployArgs {
  pub environment: String,
  pub product: String,
  pub stack_configs: Vec<ProductStackConfig>,
  pub shared_variables: HashMap<String, String>,
  pub continue_on_error: bool,
  pub session_id: String,
}

pub async fn deploy_product(
  core: Arc<Core>,
  args: ProductDeployArgs,
) -> ExecuteResult<ProductOpResponse> {
  let environment = core.environment(&args.environment).await?;
  let product = core
    .store
    .products
    .get(&args.product)
    .await
    .map_err(ExecuteError::internal)?
    .ok_or_else(|| {
      ExecuteError::not_found("Product", &args.product)
    })?;
  let definitions =
    load_definitions(&core, &product.stacks).await?;

  let mut record = ProductDeployment {
    id: new_id(),
    environment_id: environment.id.clone(),
    product_id: product.id.clone(),
    product_version: product.version.clone(),
    status: ProductDeploymentStatus::Deploying,
    shared_variables: masked_shared(
      &definitions,
      &args.shared_variables,
    ),
    ..Default::default()
  };
  core
    .store
    .product_deployments
    .insert_new(&record.id, &record)
    .await
    .map_err(ExecuteError::internal)?;

  let total = definitions.len();
  let mut results = Vec::with_capacity(total);
  let mut aborted = false;

  for (index, definition) in definitions.iter().enumerate() {
    let config = stack_config(&args.stack_configs, definition);
    let stack_name = config
      .map(|c| c.stack_name.clone())
      .filter(|name| !name.is_empty())
      .unwrap_or_else(|| definition.name.clone());

    announce_stack(
      &core,
      &args.session_id,
      ProgressPhase::ProductDeploy,
      &stack_name,
      index,
      total,
      "Deploying",
    );

    let progress = OperationProgress::compressed(
      core.bus.clone(),
      args.session_id.clone(),
      index,
      total,
    );
    let launched = launch_install(
      core.clone(),
      progress,
      engine::install::InstallArgs {
        environment: environment.id.clone(),
        stack_definition: definition.id.clone(),
        stack_name: stack_name.clone(),
        variables: config
          .map(|c| c.variables.clone())
          .unwrap_or_default(),
        attempt_id: String::new(),
        shared_variables: args.shared_variables.clone(),
        product_deployment_id: Some(record.id.clone()),
      },
    )
    .await;

    let result = match launched {
      Ok((deployment_id, _, handle)) => {
        record.stacks.push(deployment_id.clone());
        core
          .store
          .product_deployments
          .put(&record.id, &record)
          .await
          .map_err(ExecuteError::internal)?;
        await_stack(handle, &stack_name, Some(deployment_id))
          .await
      }
      Err(error) => ProductStackResult {
        stack_name: stack_name.clone(),
        deployment_id: None,
        success: false,
        error: Some(error.failure_reason()),
      },
    };

    let failed = !result.success;
    results.push(result);
    if failed && !args.continue_on_error {
      aborted = true;
      break;
    }
  }

  finalize(
    core,
    record,
    args.session_id,
    results,
    total,
    aborted,
    ProgressPhase::ProductDeploy,
  )
  .await
}

pub struct ProductUpgradeArgs {
  pub environment: String,
  pub product_deployment: String,
  pub product: String,
  pub stack_configs: Vec<ProductStackConfig>,
  pub shared_variables: HashMap<String, String>,
  pub continue_on_error: bool,
  pub session_id: String,
}

pub async fn upgrade_product(
  core: Arc<Core>,
  args: ProductUpgradeArgs,
) -> ExecuteResult<ProductOpResponse> {
  let environment = core.environment(&args.environment).await?;
  let mut record = core
    .store
    .product_deployments
    .get(&args.product_deployment)
    .await
    .map_err(ExecuteError::internal)?
    .ok_or_else(|| {
      ExecuteError::not_found(
        "ProductDeployment",
        &args.product_deployment,
      )
    })?;
  let product = core
    .store
    .products
    .get(&args.product)
    .await
    .map_err(ExecuteError::internal)?
    .ok_or_else(|| {
      ExecuteError::not_found("Product", &args.product)
    })?;
  let definitions =
    load_definitions(&core, &product.stacks).await?;

  let mut installed = Vec::new();
  for deployment_id in &record.stacks {
    installed.push(core.deployment(deployment_id).await?);
  }

  record.status = ProductDeploymentStatus::Deploying;
  record.product_id = product.id.clone();
  record.product_version = product.version.clone();
  record.shared_variables =
    masked_shared(&definitions, &args.shared_variables);
  core
    .store
    .product_deployments
    .put(&record.id, &record)
    .await
    .map_err(ExecuteError::internal)?;

  let total = definitions.len();
  let mut results = Vec::with_capacity(total);
  let mut aborted = false;

  for (index, definition) in definitions.iter().enumerate() {
    let config = stack_config(&args.stack_configs, definition);
    let stack_name = config
      .map(|c| c.stack_name.clone())
      .filter(|name| !name.is_empty())
      .unwrap_or_else(|| definition.name.clone());

    announce_stack(
      &core,
      &args.session_id,
      ProgressPhase::ProductDeploy,
      &stack_name,
      index,
      total,
      "Upgrading",
    );

    let progress = OperationProgress::compressed(
      core.bus.clone(),
      args.session_id.clone(),
      index,
      total,
    );
    let variables = config
      .map(|c| c.variables.clone())
      .unwrap_or_default();

    let existing = installed
      .iter()
      .find(|d| d.stack_name == stack_name);
    let result = match existing {
      Some(deployment) => {
        let launched = launch_upgrade(
          core.clone(),
          progress,
          engine::upgrade::UpgradeArgs {
            environment: environment.id.clone(),
            deployment: deployment.id.clone(),
            stack_definition: definition.id.clone(),
            variables,
            attempt_id: String::new(),
            shared_variables: args.shared_variables.clone(),
          },
        )
        .await;
        match launched {
          Ok((_, handle)) => {
            await_stack(
              handle,
              &stack_name,
              Some(deployment.id.clone()),
            )
            .await
          }
          Err(error) => ProductStackResult {
            stack_name: stack_name.clone(),
            deployment_id: Some(deployment.id.clone()),
            success: false,
            error: Some(error.failure_reason()),
          },
        }
      }
      // A stack added by the new product version.
      None => {
        let launched = launch_install(
          core.clone(),
          progress,
          engine::install::InstallArgs {
            environment: environment.id.clone(),
            stack_definition: definition.id.clone(),
            stack_name: stack_name.clone(),
            variables,
            attempt_id: String::new(),
            shared_variables: args.shared_variables.clone(),
            product_deployment_id: Some(record.id.clone()),
          },
        )
        .await;
        match launched {
          Ok((deployment_id, _, handle)) => {
            record.stacks.push(deployment_id.clone());
            core
              .store
              .product_deployments
              .put(&record.id, &record)
              .await
              .map_err(ExecuteError::internal)?;
            await_stack(
              handle,
              &stack_name,
              Some(deployment_id),
            )
            .await
          }
          Err(error) => ProductStackResult {
            stack_name: stack_name.clone(),
            deployment_id: None,
            success: false,
            error: Some(error.failure_reason()),
          },
        }
      }
    };

    let failed = !result.success;
    results.push(result);
    if failed && !args.continue_on_error {
      aborted = true;
      break;
    }
  }

  finalize(
    core,
    record,
    args.session_id,
    results,
    total,
    aborted,
    ProgressPhase::ProductDeploy,
  )
  .await
}

pub struct ProductRemoveArgs {
  pub environment: String,
  pub product_deployment: String,
  pub continue_on_error: bool,
  pub session_id: String,
}

/// Remove a product's stacks in reverse declared order.
pub async fn remove_product(
  core: Arc<Core>,
  args: ProductRemoveArgs,
) -> ExecuteResult<ProductOpResponse> {
  let environment = core.environment(&args.environment).await?;
  let mut record = core
    .store
    .product_deployments
    .get(&args.product_deployment)
    .await
    .map_err(ExecuteError::internal)?
    .ok_or_else(|| {
      ExecuteError::not_found(
        "ProductDeployment",
        &args.product_deployment,
      )
    })?;

  record.status = ProductDeploymentStatus::Removing;
  core
    .store
    .product_deployments
    .put(&record.id, &record)
    .await
    .map_err(ExecuteError::internal)?;

  let stacks = record
    .stacks
    .iter()
    .rev()
    .cloned()
    .collect::<Vec<_>>();
  let total = stacks.len();
  let mut results = Vec::with_capacity(total);
  let mut removed = Vec::new();
  let mut aborted = false;

  for (index, deployment_id) in stacks.iter().enumerate() {
    let Ok(deployment) = core.deployment(deployment_id).await
    else {
      // Already gone; treat as removed.
      removed.push(deployment_id.clone());
      continue;
    };
    let stack_name = deployment.stack_name.clone();

    announce_stack(
      &core,
      &args.session_id,
      ProgressPhase::ProductRemoval,
      &stack_name,
      index,
      total,
      "Removing",
    );

    let progress = OperationProgress::compressed(
      core.bus.clone(),
      args.session_id.clone(),
      index,
      total,
    );
    let launched = launch_remove(
      core.clone(),
      progress,
      engine::remove::RemoveArgs {
        environment: environment.id.clone(),
        deployment: deployment_id.clone(),
        attempt_id: String::new(),
      },
    )
    .await;
    let result = match launched {
      Ok((_, handle)) => {
        await_stack(
          handle,
          &stack_name,
          Some(deployment_id.clone()),
        )
        .await
      }
      Err(error) => ProductStackResult {
        stack_name: stack_name.clone(),
        deployment_id: Some(deployment_id.clone()),
        success: false,
        error: Some(error.failure_reason()),
      },
    };

    if result.success {
      removed.push(deployment_id.clone());
    }
    let failed = !result.success;
    results.push(result);
    if failed && !args.continue_on_error {
      aborted = true;
      break;
    }
  }

  record.stacks.retain(|id| !removed.contains(id));

  let all_removed = record.stacks.is_empty()
    && results.iter().all(|r| r.success);
  if all_removed {
    core
      .store
      .product_deployments
      .delete(&record.id)
      .await
      .map_err(ExecuteError::internal)?;
    let response = terminal_response(
      &core,
      record.id.clone(),
      args.session_id,
      results,
      ProductDeploymentStatus::Deployed,
      false,
      ProgressPhase::ProductRemoval,
      "Product removed",
    );
    return Ok(response);
  }

  let status = aggregate_status(&results, total);
  record.status = status;
  core
    .store
    .product_deployments
    .put(&record.id, &record)
    .await
    .map_err(ExecuteError::internal)?;
  Ok(terminal_response(
    &core,
    record.id,
    args.session_id,
    results,
    status,
    aborted || status == ProductDeploymentStatus::Failed,
    ProgressPhase::ProductRemoval,
    "Product removal finished with failures",
  ))
}

async fn load_definitions(
  core: &Core,
  ids: &[String],
) -> ExecuteResult<Vec<StackDefinition>> {
  let mut definitions = Vec::with_capacity(ids.len());
  for id in ids {
    definitions.push(
      core
        .store
        .stack_definitions
        .get(id)
        .await
        .map_err(ExecuteError::internal)?
        .ok_or_else(|| {
          ExecuteError::not_found("StackDefinition", id)
        })?,
    );
  }
  Ok(definitions)
}

fn stack_config<'a>(
  configs: &'a [ProductStackConfig],
  definition: &StackDefinition,
) -> Option<&'a ProductStackConfig> {
  configs
    .iter()
    .find(|c| c.stack_definition_id == definition.id)
}

/// Shared values persisted on the product deployment, with
/// secret-kind values masked.
fn masked_shared(
  definitions: &[StackDefinition],
  shared: &HashMap<String, String>,
) -> HashMap<String, String> {
  let secret_names = definitions
    .iter()
    .flat_map(|d| d.variables.iter())
    .filter(|v| v.kind == VariableKind::Secret)
    .map(|v| v.name.as_str())
    .collect::<std::collections::HashSet<_>>();
  shared
    .iter()
    .map(|(name, value)| {
      let value = if secret_names.contains(name.as_str()) {
        rsgo_client::entities::SECRET_MASK.to_string()
      } else {
        value.clone()
      };
      (name.clone(), value)
    })
    .collect()
}

fn announce_stack(
  core: &Core,
  session_id: &str,
  phase: ProgressPhase,
  stack_name: &str,
  index: usize,
  total: usize,
  verb: &str,
) {
  core.bus.publish(ProgressEvent {
    session_id: session_id.to_string(),
    phase,
    message: format!(
      "{verb} stack {}/{total}: {stack_name}",
      index + 1
    ),
    current_service: Some(stack_name.to_string()),
    percent_complete: ((index as f64 / total.max(1) as f64)
      * 100.0) as u8,
    ..Default::default()
  });
}

async fn await_stack(
  handle: engine::OpHandle,
  stack_name: &str,
  deployment_id: Option<String>,
) -> ProductStackResult {
  match handle.await {
    Ok(Ok(())) => ProductStackResult {
      stack_name: stack_name.to_string(),
      deployment_id,
      success: true,
      error: None,
    },
    Ok(Err(error)) => ProductStackResult {
      stack_name: stack_name.to_string(),
      deployment_id,
      success: false,
      error: Some(error.failure_reason()),
    },
    Err(join) => ProductStackResult {
      stack_name: stack_name.to_string(),
      deployment_id,
      success: false,
      error: Some(format!("operation task panicked: {join}")),
    },
  }
}

fn aggregate_status(
  results: &[ProductStackResult],
  total: usize,
) -> ProductDeploymentStatus {
  let succeeded = results.iter().filter(|r| r.success).count();
  if succeeded == total {
    ProductDeploymentStatus::Deployed
  } else if succeeded > 0 {
    ProductDeploymentStatus::Partial
  } else {
    ProductDeploymentStatus::Failed
  }
}

async fn finalize(
  core: Arc<Core>,
  mut record: ProductDeployment,
  session_id: String,
  results: Vec<ProductStackResult>,
  total: usize,
  aborted: bool,
  phase: ProgressPhase,
) -> ExecuteResult<ProductOpResponse> {
  let status = aggregate_status(&results, total);
  record.status = status;
  core
    .store
    .product_deployments
    .put(&record.id, &record)
    .await
    .map_err(ExecuteError::internal)?;

  let message = match status {
    ProductDeploymentStatus::Deployed => "Product deployed",
    ProductDeploymentStatus::Partial => {
      "Product deployed with failures"
    }
    _ => "Product deploy failed",
  };
  Ok(terminal_response(
    &core,
    record.id,
    session_id,
    results,
    status,
    aborted || status == ProductDeploymentStatus::Failed,
    phase,
    message,
  ))
}

/// Publish the orchestrator's single terminal event and shape
/// the response.
#[allow(clippy::too_many_arguments)]
fn terminal_response(
  core: &Core,
  product_deployment_id: String,
  session_id: String,
  results: Vec<ProductStackResult>,
  status: ProductDeploymentStatus,
  is_error: bool,
  phase: ProgressPhase,
  message: &str,
) -> ProductOpResponse {
  core.bus.publish(ProgressEvent {
    session_id: session_id.clone(),
    phase,
    message: message.to_string(),
    percent_complete: 100,
    is_complete: true,
    is_error,
    error_message: is_error.then(|| {
      results
        .iter()
        .filter_map(|r| r.error.clone())
        .collect::<Vec<_>>()
        .join("; ")
    }),
    ..Default::default()
  });
  ProductOpResponse {
    product_deployment_id,
    session_id,
    status,
    results,
  }
}
