//! Upgrade snapshotting, rollback by digest, and the
//! per-deployment concurrency guard.

mod common;

use std::collections::HashMap;

use resolver_api::Resolve;
use rsgo_client::{
  api::{
    execute::{DeployStack, RollbackStack, UpgradeStack},
    read::CanRollback,
  },
  entities::deployment::{DeploymentStatus, OperationKind},
};
use rsgo_core::api::{ExecuteArgs, ReadArgs};

use common::{harness, seed_definition, wait_terminal};

const REDIS_V1: &str = "
services:
  cache:
    image: redis:7.0
";

const REDIS_V2: &str = "
services:
  cache:
    image: redis:7.2
    environment:
      - MAXMEMORY=${MAXMEM:-128mb}
";

async fn install_v1(h: &common::Harness) -> String {
  seed_definition(&h.core, "redis-v1", "v1", REDIS_V1, vec![])
    .await;
  seed_definition(&h.core, "redis-v2", "v2", REDIS_V2, vec![])
    .await;
  h.docker.digests.lock().unwrap().insert(
    String::from("redis:7.0"),
    String::from("redis@sha256:aaaa"),
  );

  let mut receiver = h.core.bus.subscribe("install");
  let response = DeployStack {
    environment: h.environment.id.clone(),
    stack_definition: String::from("redis-v1"),
    stack_name: String::from("cache"),
    variables: Default::default(),
    session_id: String::from("install"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();
  let terminal = wait_terminal(&mut receiver).await;
  assert!(!terminal.is_error);
  response.deployment_id
}

#[tokio::test]
async fn failed_upgrade_is_rollback_eligible_and_rolls_back() {
  let h = harness().await;
  let deployment_id = install_v1(&h).await;

  // The new image cannot be pulled.
  h.docker
    .fail_pulls
    .lock()
    .unwrap()
    .insert(String::from("redis:7.2"));

  let mut receiver = h.core.bus.subscribe("upgrade");
  UpgradeStack {
    environment: h.environment.id.clone(),
    deployment: deployment_id.clone(),
    stack_definition: String::from("redis-v2"),
    variables: HashMap::from([(
      String::from("MAXMEM"),
      String::from("256mb"),
    )]),
    session_id: String::from("upgrade"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();

  let terminal = wait_terminal(&mut receiver).await;
  assert!(terminal.is_error);

  let deployment =
    h.core.deployment(&deployment_id).await.unwrap();
  assert_eq!(deployment.status, DeploymentStatus::Failed);
  assert_eq!(
    deployment.last_operation,
    Some(OperationKind::Upgrade)
  );
  assert!(
    deployment
      .last_failure_reason
      .as_deref()
      .unwrap_or_default()
      .contains("redis:7.2")
  );

  // The pre-upgrade snapshot makes rollback eligible.
  let eligible = CanRollback {
    deployment: deployment_id.clone(),
  }
  .resolve(&ReadArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();
  assert!(eligible.eligible);

  // The original container is still in place: failures leave
  // state for the operator to act on.
  assert!(h.docker.container("cache-cache").is_some());

  let mut receiver = h.core.bus.subscribe("rollback");
  RollbackStack {
    environment: h.environment.id.clone(),
    deployment: deployment_id.clone(),
    session_id: String::from("rollback"),
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
    h.core.deployment(&deployment_id).await.unwrap();
  assert_eq!(deployment.status, DeploymentStatus::Running);
  assert_eq!(deployment.current_version, "v1");

  // Rollback pulled by the recorded digest, not the tag.
  assert!(
    h.docker
      .pulled
      .lock()
      .unwrap()
      .iter()
      .any(|image| image == "redis@sha256:aaaa")
  );
  assert!(h.docker.container("cache-cache").unwrap().running);
}

#[tokio::test]
async fn successful_upgrade_replaces_the_snapshot() {
  let h = harness().await;
  let deployment_id = install_v1(&h).await;

  let mut receiver = h.core.bus.subscribe("upgrade-ok");
  UpgradeStack {
    environment: h.environment.id.clone(),
    deployment: deployment_id.clone(),
    stack_definition: String::from("redis-v2"),
    variables: HashMap::from([(
      String::from("MAXMEM"),
      String::from("256mb"),
    )]),
    session_id: String::from("upgrade-ok"),
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
    h.core.deployment(&deployment_id).await.unwrap();
  assert_eq!(deployment.status, DeploymentStatus::Running);
  assert_eq!(deployment.current_version, "v2");
  assert_eq!(deployment.upgrade_count, 1);

  // Exactly one active pre-upgrade snapshot, replaced to
  // represent the now-current state.
  let snapshots = h
    .core
    .snapshots
    .list_for(&deployment_id)
    .await
    .unwrap();
  assert_eq!(snapshots.len(), 1);
  assert_eq!(snapshots[0].target_version, "v2");

  // The changed service was recreated with the new image.
  assert_eq!(
    h.docker.container("cache-cache").unwrap().image,
    "redis:7.2"
  );
}

#[tokio::test]
async fn upgrade_requires_running_state() {
  let h = harness().await;
  let deployment_id = install_v1(&h).await;

  // Force the deployment into Failed first.
  h.docker
    .fail_pulls
    .lock()
    .unwrap()
    .insert(String::from("redis:7.2"));
  let mut receiver = h.core.bus.subscribe("up-fail");
  UpgradeStack {
    environment: h.environment.id.clone(),
    deployment: deployment_id.clone(),
    stack_definition: String::from("redis-v2"),
    variables: Default::default(),
    session_id: String::from("up-fail"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap();
  wait_terminal(&mut receiver).await;

  // Upgrade from Failed is not allowed; rollback or remove is.
  let err = UpgradeStack {
    environment: h.environment.id.clone(),
    deployment: deployment_id.clone(),
    stack_definition: String::from("redis-v2"),
    variables: Default::default(),
    session_id: String::from("up-again"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap_err();
  assert!(err.error.to_string().contains("requires Running"));
}

#[tokio::test]
async fn rollback_without_snapshot_reports_no_snapshot() {
  let h = harness().await;
  let deployment_id = install_v1(&h).await;

  let err = RollbackStack {
    environment: h.environment.id.clone(),
    deployment: deployment_id,
    session_id: String::from("rb"),
    attempt_id: String::new(),
  }
  .resolve(&ExecuteArgs {
    core: h.core.clone(),
  })
  .await
  .unwrap_err();
  // Running deployments are not rollback eligible at all.
  assert!(
    err.error.to_string().contains("requires a failed upgrade")
  );
}
