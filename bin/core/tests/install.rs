//! End-to-end install behavior against the scripted daemon.

mod common;

use resolver_api::Resolve;
use rsgo_client::{
  api::{execute::DeployStack, read::GetStackHealth},
  entities::{
    deployment::DeploymentStatus,
    health::StackHealthStatus,
    labels,
    source::{VariableKind, VariableSpec},
  },
};
use rsgo_core::api::{ExecuteArgs, ReadArgs, ReadRequest};

use common::{harness, seed_definition, wait_terminal};

const WEB_COMPOSE: &str = "
services:
  web:
    image: nginx:alpine
    ports:
      - 8080:80
";

#[tokio::test]
async fn single_stack_install_reaches_running() {
  let h = harness().await;
  seed_definition(&h.core, "web-def", "1.0.0", WEB_COMPOSE, vec![])
    .await;

  let mut receiver = h.core.bus.subscribe("s1");
  let response = DeployStack {
    environment: h.environment.id.clone(),
    stack_definition: String::from("web-def"),
    stack_name: String::from("demo"),
    variables: Default::default(),
    session_id: String::from("s1"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  let terminal = wait_terminal(&mut receiver).await;
  assert!(!terminal.is_error);
  assert_eq!(terminal.percent_complete, 100);

  let deployment =
    h.core.deployment(&response.deployment_id).await.unwrap();
  assert_eq!(deployment.status, DeploymentStatus::Running);
  assert_eq!(deployment.current_version, "1.0.0");
  assert_eq!(deployment.services.len(), 1);
  assert_eq!(deployment.services[0].service_name, "web");

  // Every managed container carries the five rsgo labels.
  let container = h.docker.container("demo-web").unwrap();
  assert!(container.running);
  assert_eq!(
    container.labels.get(labels::DEPLOYMENT),
    Some(&response.deployment_id)
  );
  assert_eq!(
    container.labels.get(labels::STACK),
    Some(&String::from("demo"))
  );
  assert_eq!(
    container.labels.get(labels::SERVICE),
    Some(&String::from("web"))
  );
  assert_eq!(
    container.labels.get(labels::MANAGED),
    Some(&String::from("true"))
  );
  assert_eq!(
    container.labels.get(labels::VERSION),
    Some(&String::from("1.0.0"))
  );

  // Health settles within a forced reconcile.
  let health = GetStackHealth {
    environment: h.environment.id.clone(),
    deployment: response.deployment_id.clone(),
    force_refresh: true,
  }
  .resolve(&ReadArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();
  assert_eq!(
    health.state.overall_status,
    StackHealthStatus::Healthy
  );
  assert_eq!(health.summary.healthy, 1);
  assert_eq!(health.summary.total, 1);
  assert_eq!(health.summary.message, "1/1 services healthy");

  // The read dispatch enum serializes responses for transports.
  let listed = ReadRequest::ListDeployments(
    rsgo_client::api::read::ListDeployments {
      environment: h.environment.id.clone(),
    },
  )
  .resolve(&ReadArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();
  assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn progress_percent_is_monotonic() {
  let h = harness().await;
  seed_definition(&h.core, "web-def", "1.0.0", WEB_COMPOSE, vec![])
    .await;

  let mut receiver = h.core.bus.subscribe("s-mono");
  DeployStack {
    environment: h.environment.id.clone(),
    stack_definition: String::from("web-def"),
    stack_name: String::from("demo"),
    variables: Default::default(),
    session_id: String::from("s-mono"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  let percents = common::collect_percents(&mut receiver).await;
  assert!(percents.windows(2).all(|w| w[0] <= w[1]));
  assert_eq!(*percents.last().unwrap(), 100);
}

#[tokio::test]
async fn duplicate_stack_name_is_rejected() {
  let h = harness().await;
  seed_definition(&h.core, "web-def", "1.0.0", WEB_COMPOSE, vec![])
    .await;

  let mut receiver = h.core.bus.subscribe("s1");
  let request = DeployStack {
    environment: h.environment.id.clone(),
    stack_definition: String::from("web-def"),
    stack_name: String::from("demo"),
    variables: Default::default(),
    session_id: String::from("s1"),
    attempt_id: String::new(),
  };
  request
    .clone()
    .resolve(&ExecuteArgs {
      core: h.core.clone(),
    })
    .await
    .unwrap();
  wait_terminal(&mut receiver).await;

  let err = DeployStack {
    session_id: String::from("s2"),
    ..request
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap_err();
  assert!(err.error.to_string().contains("already in use"));
}

#[tokio::test]
async fn same_attempt_id_returns_same_session_and_one_deployment() {
  let h = harness().await;
  seed_definition(&h.core, "web-def", "1.0.0", WEB_COMPOSE, vec![])
    .await;

  let request = DeployStack {
    environment: h.environment.id.clone(),
    stack_definition: String::from("web-def"),
    stack_name: String::from("demo"),
    variables: Default::default(),
    session_id: String::from("s1"),
    attempt_id: String::from("attempt-1"),
  };
  let first = request
    .clone()
    .resolve(&ExecuteArgs {
      core: h.core.clone(),
    })
    .await
    .unwrap();
  let second = request
    .resolve(&ExecuteArgs {
      core: h.core.clone(),
    })
    .await
    .unwrap();

  assert_eq!(first.deployment_id, second.deployment_id);
  assert_eq!(first.session_id, second.session_id);

  let deployments =
    h.core.store.deployments.list().await.unwrap();
  assert_eq!(deployments.len(), 1);
}

#[tokio::test]
async fn missing_required_variable_fails_validation() {
  let h = harness().await;
  seed_definition(
    &h.core,
    "db-def",
    "1.0.0",
    "
services:
  db:
    image: postgres:16
    environment:
      - POSTGRES_PASSWORD=${DB_PASSWORD:?database password is required}
",
    vec![VariableSpec {
      name: String::from("DB_PASSWORD"),
      is_required: true,
      kind: VariableKind::Secret,
      ..Default::default()
    }],
  )
  .await;

  let err = DeployStack {
    environment: h.environment.id.clone(),
    stack_definition: String::from("db-def"),
    stack_name: String::from("db"),
    variables: Default::default(),
    session_id: String::from("s1"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap_err();
  assert!(
    err.error.to_string().contains("DB_PASSWORD"),
    "unexpected: {}",
    err.error
  );

  // Pre-flight failure: nothing was persisted or created.
  assert!(
    h.core.store.deployments.list().await.unwrap().is_empty()
  );
  assert!(h.docker.container_names().is_empty());
}

#[tokio::test]
async fn failing_init_container_aborts_before_services() {
  let h = harness().await;
  seed_definition(
    &h.core,
    "app-def",
    "2.0.0",
    "
services:
  init-db:
    image: migrator:1
    labels:
      rsgo.init.order: \"1\"
  app:
    image: app:1
",
    vec![],
  )
  .await;
  h.docker
    .exit_codes
    .lock()
    .unwrap()
    .insert(String::from("demo-init-db"), 1);
  h.docker.log_lines.lock().unwrap().insert(
    String::from("demo-init-db"),
    vec![
      String::from("running migrations"),
      String::from("migration failed: relation exists"),
    ],
  );

  let mut receiver = h.core.bus.subscribe("s1");
  let response = DeployStack {
    environment: h.environment.id.clone(),
    stack_definition: String::from("app-def"),
    stack_name: String::from("demo"),
    variables: Default::default(),
    session_id: String::from("s1"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  let terminal = wait_terminal(&mut receiver).await;
  assert!(terminal.is_error);
  assert!(
    terminal
      .error_message
      .as_deref()
      .unwrap_or_default()
      .contains("init-db")
  );

  let deployment =
    h.core.deployment(&response.deployment_id).await.unwrap();
  assert_eq!(deployment.status, DeploymentStatus::Failed);
  assert_eq!(deployment.init_container_results.len(), 1);
  let result = &deployment.init_container_results[0];
  assert_eq!(result.exit_code, 1);
  assert!(!result.success);
  assert!(
    result
      .logs
      .iter()
      .any(|line| line.contains("migration failed"))
  );

  // No main service container was ever created.
  assert_eq!(h.docker.container_names(), vec!["demo-init-db"]);
}

#[tokio::test]
async fn continue_policy_records_failure_and_proceeds() {
  let h = harness().await;
  seed_definition(
    &h.core,
    "app-def",
    "2.0.0",
    "
services:
  seed:
    image: seeder:1
    labels:
      rsgo.init.order: \"1\"
      rsgo.init.failurePolicy: continue
  app:
    image: app:1
",
    vec![],
  )
  .await;
  h.docker
    .exit_codes
    .lock()
    .unwrap()
    .insert(String::from("demo-seed"), 3);

  let mut receiver = h.core.bus.subscribe("s1");
  let response = DeployStack {
    environment: h.environment.id.clone(),
    stack_definition: String::from("app-def"),
    stack_name: String::from("demo"),
    variables: Default::default(),
    session_id: String::from("s1"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  let terminal = wait_terminal(&mut receiver).await;
  assert!(!terminal.is_error);

  let deployment =
    h.core.deployment(&response.deployment_id).await.unwrap();
  assert_eq!(deployment.status, DeploymentStatus::Running);
  let result = &deployment.init_container_results[0];
  assert_eq!(result.exit_code, 3);
  assert!(!result.success);
  // The main service still came up.
  assert!(h.docker.container("demo-app").unwrap().running);
}
