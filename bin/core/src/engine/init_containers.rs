//! Runs the plan's init containers strictly in order, streaming
//! their output to the session and enforcing exit-code policy.

use futures_util::StreamExt;
use rsgo_client::entities::{
  deployment::{Deployment, InitContainerResult},
  progress::{LogEntry, ProgressPhase},
  rsgo_timestamp,
};

use crate::{
  error::{ExecuteError, ExecuteResult},
  plan::{FailurePolicy, ServicePlan},
};

use super::{OpCtx, container_name, create_and_start};

/// Lines of output retained per init container on the result.
const CAPTURED_LOG_LINES: usize = 100;

/// Run every init container of the plan, ascending by order.
///
/// Each completed run is recorded on the deployment and
/// persisted, so an aborting failure leaves the partial results
/// behind. Returns `InitContainerFailed` on a non-zero exit with
/// the `abort` policy.
pub(crate) async fn run_init_containers(
  ctx: &OpCtx,
  deployment: &mut Deployment,
  version: &str,
  plan: &ServicePlan,
) -> ExecuteResult<()> {
  let total = plan.init_containers.len() as u64;
  deployment.init_container_results.clear();

  for (index, init) in plan.init_containers.iter().enumerate() {
    let service = &init.node.name;
    let name =
      container_name(&deployment.stack_name, service);
    ctx.progress.step(
      ProgressPhase::InitializingContainers,
      format!("Running init container {service}"),
      Some(service),
      index as u64,
      total,
    );

    // A previous attempt may have left an exited container
    // under the same name.
    let _ = ctx.docker.remove_container(&name, true).await;

    create_and_start(ctx, deployment, version, &init.node)
      .await?;

    let logs = stream_logs(ctx, &name).await;
    let exit_code = ctx
      .docker
      .wait_container(&name)
      .await
      .map_err(ExecuteError::internal)?;
    let logs = logs.await.unwrap_or_default();

    let success = exit_code == 0;
    deployment.init_container_results.push(InitContainerResult {
      service_name: service.clone(),
      exit_code,
      success,
      logs,
    });
    ctx.core.persist(deployment).await?;

    if !success && init.failure_policy == FailurePolicy::Abort {
      return Err(ExecuteError::InitContainerFailed {
        service: service.clone(),
        exit_code,
      });
    }

    ctx.progress.step(
      ProgressPhase::InitializingContainers,
      format!(
        "Init container {service} exited with code {exit_code}"
      ),
      Some(service),
      index as u64 + 1,
      total,
    );
  }

  Ok(())
}

/// Relay the container's output line by line onto the session,
/// returning a handle resolving to the captured tail.
async fn stream_logs(
  ctx: &OpCtx,
  container: &str,
) -> tokio::task::JoinHandle<Vec<String>> {
  let bus = ctx.core.bus.clone();
  let session_id = ctx.progress.session_id.clone();
  let container = container.to_string();
  let stream = ctx.docker.follow_logs(&container).await;
  tokio::spawn(async move {
    let mut captured = Vec::new();
    let Ok(mut stream) = stream else {
      return captured;
    };
    while let Some(line) = stream.next().await {
      bus.publish_log(LogEntry {
        session_id: session_id.clone(),
        container_name: container.clone(),
        log_line: line.clone(),
        ts: rsgo_timestamp(),
      });
      captured.push(line);
      if captured.len() > CAPTURED_LOG_LINES {
        captured.remove(0);
      }
    }
    captured
  })
}
