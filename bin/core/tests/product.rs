//! Product orchestration: sequential stacks, shared variables,
//! partial failure policy.

mod common;

use std::collections::HashMap;

use resolver_api::Resolve;
use rsgo_client::{
  api::execute::{
    DeployProduct, ProductStackConfig, RemoveProduct,
  },
  entities::{
    deployment::{DeploymentStatus, ProductDeploymentStatus},
    source::Product,
  },
};
use rsgo_core::{
  api::ExecuteArgs,
  progress::BusEvent,
};

use common::{harness, seed_definition};

fn stack_compose(service: &str, healthcheck: bool) -> String {
  let health = if healthcheck {
    "
    healthcheck:
      test: [\"CMD\", \"true\"]
"
  } else {
    "\n"
  };
  format!(
    "services:
  {service}:
    image: {service}:1
    environment:
      - SHARED_TOKEN=${{SHARED_TOKEN:-none}}{health}"
  )
}

async fn seed_product(h: &common::Harness, healthcheck_b: bool) {
  for (id, healthcheck) in
    [("stack-a", false), ("stack-b", healthcheck_b), ("stack-c", false)]
  {
    let service = id.replace("stack-", "svc-");
    seed_definition(
      &h.core,
      id,
      "1.0.0",
      &stack_compose(&service, healthcheck),
      vec![],
    )
    .await;
  }
  let product = Product {
    id: String::from("prod"),
    name: String::from("Suite"),
    version: String::from("1.0.0"),
    stacks: vec![
      String::from("stack-a"),
      String::from("stack-b"),
      String::from("stack-c"),
    ],
  };
  h.core
    .store
    .products
    .put(&product.id, &product)
    .await
    .unwrap();
}

fn configs() -> Vec<ProductStackConfig> {
  ["stack-a", "stack-b", "stack-c"]
    .into_iter()
    .map(|id| ProductStackConfig {
      stack_definition_id: id.to_string(),
      stack_name: id.replace("stack-", "app-"),
      variables: Default::default(),
    })
    .collect()
}

#[tokio::test]
async fn deploys_all_stacks_in_order() {
  let h = harness().await;
  seed_product(&h, false).await;

  let mut receiver = h.core.bus.subscribe("prod");
  let response = DeployProduct {
    environment: h.environment.id.clone(),
    product: String::from("prod"),
    stack_configs: configs(),
    shared_variables: HashMap::from([(
      String::from("SHARED_TOKEN"),
      String::from("tok-123"),
    )]),
    continue_on_error: false,
    session_id: String::from("prod"),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  assert_eq!(response.status, ProductDeploymentStatus::Deployed);
  assert_eq!(response.results.len(), 3);
  assert!(response.results.iter().all(|r| r.success));

  // One terminal event for the whole product session, percent
  // never decreasing across the compressed stack bands.
  let mut percents = Vec::new();
  let mut terminals = 0;
  while let Some(event) = receiver.try_recv() {
    if let BusEvent::Progress(event) = event {
      percents.push(event.percent_complete);
      if event.is_complete {
        terminals += 1;
      }
    }
  }
  assert_eq!(terminals, 1);
  assert!(percents.windows(2).all(|w| w[0] <= w[1]));
  assert_eq!(*percents.last().unwrap(), 100);

  // All three deployments exist, linked to the product record.
  let record = h
    .core
    .store
    .product_deployments
    .get(&response.product_deployment_id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(record.stacks.len(), 3);
  for deployment_id in &record.stacks {
    let deployment =
      h.core.deployment(deployment_id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert_eq!(
      deployment.product_deployment_id.as_deref(),
      Some(response.product_deployment_id.as_str())
    );
    // Shared variable flowed into every stack.
    assert_eq!(
      deployment.configuration.get("SHARED_TOKEN"),
      Some(&String::from("tok-123"))
    );
  }
}

#[tokio::test]
async fn partial_failure_with_continue_on_error() {
  let h = harness().await;
  seed_product(&h, true).await;
  // Stack B's service never reports healthy.
  h.docker.health_overrides.lock().unwrap().insert(
    String::from("app-b-svc-b"),
    rsgo_core::docker::ContainerHealthKind::Unhealthy,
  );

  let response = DeployProduct {
    environment: h.environment.id.clone(),
    product: String::from("prod"),
    stack_configs: configs(),
    shared_variables: Default::default(),
    continue_on_error: true,
    session_id: String::from("prod-partial"),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  assert_eq!(response.status, ProductDeploymentStatus::Partial);
  let by_name = response
    .results
    .iter()
    .map(|r| (r.stack_name.as_str(), r.success))
    .collect::<Vec<_>>();
  assert_eq!(
    by_name,
    vec![("app-a", true), ("app-b", false), ("app-c", true)]
  );

  let failed = response
    .results
    .iter()
    .find(|r| r.stack_name == "app-b")
    .unwrap();
  assert!(
    failed
      .error
      .as_deref()
      .unwrap_or_default()
      .contains("svc-b")
  );

  // The terminal event is complete but not an error: partial
  // success is still a delivered result.
  let retained =
    h.core.bus.retained("prod-partial").unwrap();
  assert!(retained.is_complete);
  assert!(!retained.is_error);
}

#[tokio::test]
async fn stop_on_first_failure_without_continue() {
  let h = harness().await;
  seed_product(&h, true).await;
  h.docker.health_overrides.lock().unwrap().insert(
    String::from("app-b-svc-b"),
    rsgo_core::docker::ContainerHealthKind::Unhealthy,
  );

  let response = DeployProduct {
    environment: h.environment.id.clone(),
    product: String::from("prod"),
    stack_configs: configs(),
    shared_variables: Default::default(),
    continue_on_error: false,
    session_id: String::from("prod-stop"),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  // A succeeded, B failed, C never ran.
  assert_eq!(response.status, ProductDeploymentStatus::Partial);
  assert_eq!(response.results.len(), 2);
  assert!(response.results[0].success);
  assert!(!response.results[1].success);
  assert!(h.docker.container("app-c-svc-c").is_none());

  // Aborting early publishes a terminal error.
  let retained = h.core.bus.retained("prod-stop").unwrap();
  assert!(retained.is_complete);
  assert!(retained.is_error);
}

#[tokio::test]
async fn remove_product_tears_down_in_reverse() {
  let h = harness().await;
  seed_product(&h, false).await;

  let deployed = DeployProduct {
    environment: h.environment.id.clone(),
    product: String::from("prod"),
    stack_configs: configs(),
    shared_variables: Default::default(),
    continue_on_error: false,
    session_id: String::from("prod-up"),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();
  assert_eq!(deployed.status, ProductDeploymentStatus::Deployed);

  let removed = RemoveProduct {
    environment: h.environment.id.clone(),
    product_deployment: deployed.product_deployment_id.clone(),
    continue_on_error: false,
    session_id: String::from("prod-down"),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  assert!(removed.results.iter().all(|r| r.success));
  // Removal ran in reverse declared order.
  let order = removed
    .results
    .iter()
    .map(|r| r.stack_name.as_str())
    .collect::<Vec<_>>();
  assert_eq!(order, vec!["app-c", "app-b", "app-a"]);

  // Everything is gone: containers, deployments, the product
  // deployment record itself.
  assert!(h.docker.container_names().is_empty());
  assert!(
    h.core.store.deployments.list().await.unwrap().is_empty()
  );
  assert!(
    h.core
      .store
      .product_deployments
      .get(&deployed.product_deployment_id)
      .await
      .unwrap()
      .is_none()
  );
}
