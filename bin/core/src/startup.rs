//! Startup recovery: operations that were in flight when the
//! previous process died are swept to `Failed`, then one forced
//! reconcile aligns health with whatever the daemons really have.
//!
//! Snapshots are untouched, so rollback stays available where it
//! applied. Progress sessions from the dead process are gone;
//! reconnecting subscribers observe the persisted `Failed`.

use std::sync::Arc;

use rsgo_client::entities::deployment::DeploymentStatus;

use crate::{monitor, state::Core};

pub async fn on_startup(core: &Arc<Core>) {
  recover_in_flight_operations(core).await;
  initial_reconcile(core).await;
}

async fn recover_in_flight_operations(core: &Arc<Core>) {
  let deployments = match core.store.deployments.list().await {
    Ok(deployments) => deployments,
    Err(e) => {
      error!(
        "failed to list deployments for startup recovery | {e:#}"
      );
      return;
    }
  };
  for mut deployment in deployments {
    if !deployment.in_flight() {
      continue;
    }
    let phase = deployment.status;
    deployment.status = DeploymentStatus::Failed;
    deployment.last_failure_reason =
      Some(format!("process terminated during {phase}"));
    match core.persist(&deployment).await {
      Ok(()) => warn!(
        "recovered deployment {} ({}): marked Failed after dying in {phase}",
        deployment.stack_name, deployment.id
      ),
      Err(e) => error!(
        "failed to mark {} Failed during recovery | {e:#}",
        deployment.id
      ),
    }
  }
}

async fn initial_reconcile(core: &Arc<Core>) {
  let environments = match core.store.environments.list().await {
    Ok(environments) => environments,
    Err(e) => {
      error!(
        "failed to list environments for startup reconcile | {e:#}"
      );
      return;
    }
  };
  for environment in environments {
    monitor::update_health_for_environment(
      core,
      &environment,
      true,
    )
    .await;
  }
}
