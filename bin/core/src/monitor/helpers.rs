use rsgo_client::entities::{
  deployment::{Deployment, DeploymentStatus},
  health::{
    HealthState, OperationMode, ServiceHealth,
    ServiceHealthStatus, StackHealthStatus,
  },
  rsgo_timestamp,
};

use crate::docker::{
  ContainerDetails, ContainerHealthKind, ContainerSummary,
};

/// Per-service status from the daemon's view.
///
/// A declared healthcheck wins; otherwise running without a
/// restart since the last sample counts as healthy, a fresh
/// restart as starting, anything else as unhealthy.
pub fn derive_service_health(
  service_name: &str,
  summary: Option<&ContainerSummary>,
  details: Option<&ContainerDetails>,
  previous: Option<&ServiceHealth>,
) -> ServiceHealth {
  let Some(summary) = summary else {
    return ServiceHealth {
      service_name: service_name.to_string(),
      status: ServiceHealthStatus::Unknown,
      reason: Some(String::from("container not found")),
      ..Default::default()
    };
  };
  let Some(details) = details else {
    return ServiceHealth {
      service_name: service_name.to_string(),
      status: ServiceHealthStatus::Unknown,
      container_id: Some(summary.id.clone()),
      container_name: Some(summary.name.clone()),
      reason: Some(String::from("inspect failed")),
      ..Default::default()
    };
  };

  let status = match details.health {
    Some(ContainerHealthKind::Healthy) => {
      ServiceHealthStatus::Healthy
    }
    Some(ContainerHealthKind::Starting) => {
      ServiceHealthStatus::Starting
    }
    Some(ContainerHealthKind::Unhealthy) => {
      ServiceHealthStatus::Unhealthy
    }
    None => {
      let restarted = previous
        .map(|p| details.restart_count > p.restart_count)
        .unwrap_or(false);
      if details.running && !restarted {
        ServiceHealthStatus::Healthy
      } else if details.running {
        ServiceHealthStatus::Starting
      } else {
        ServiceHealthStatus::Unhealthy
      }
    }
  };

  let reason = match status {
    ServiceHealthStatus::Unhealthy => {
      Some(if details.running {
        String::from("healthcheck failing")
      } else {
        format!(
          "container exited with code {}",
          details.exit_code.unwrap_or_default()
        )
      })
    }
    ServiceHealthStatus::Starting => {
      Some(String::from("recently restarted"))
    }
    _ => None,
  };

  ServiceHealth {
    service_name: service_name.to_string(),
    status,
    container_id: Some(details.id.clone()),
    container_name: Some(details.name.clone()),
    restart_count: details.restart_count,
    reason,
  }
}

/// All healthy wins, any unhealthy loses, a mix degrades.
pub fn derive_overall(
  services: &[ServiceHealth],
) -> StackHealthStatus {
  if services.is_empty()
    || services
      .iter()
      .all(|s| s.status == ServiceHealthStatus::Unknown)
  {
    return StackHealthStatus::Unknown;
  }
  if services
    .iter()
    .any(|s| s.status == ServiceHealthStatus::Unhealthy)
  {
    return StackHealthStatus::Unhealthy;
  }
  if services
    .iter()
    .all(|s| s.status == ServiceHealthStatus::Healthy)
  {
    return StackHealthStatus::Healthy;
  }
  StackHealthStatus::Degraded
}

/// The engine's in-flight status wins, then the user's
/// maintenance toggle.
pub fn operation_mode(deployment: &Deployment) -> OperationMode {
  match deployment.status {
    DeploymentStatus::Upgrading => OperationMode::Upgrading,
    DeploymentStatus::RollingBack => OperationMode::RollingBack,
    _ if deployment.maintenance => OperationMode::Maintenance,
    _ => OperationMode::Normal,
  }
}

/// The sample recorded when the daemon cannot be reached:
/// everything Unknown, nothing requiring attention, deployment
/// state untouched.
pub fn unknown_sample(deployment: &Deployment) -> HealthState {
  HealthState {
    deployment_id: deployment.id.clone(),
    overall_status: StackHealthStatus::Unknown,
    operation_mode: operation_mode(deployment),
    requires_attention: false,
    services: deployment
      .services
      .iter()
      .map(|instance| ServiceHealth {
        service_name: instance.service_name.clone(),
        status: ServiceHealthStatus::Unknown,
        reason: Some(String::from("daemon unreachable")),
        ..Default::default()
      })
      .collect(),
    captured_at_utc: rsgo_timestamp(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn healthy(name: &str) -> ServiceHealth {
    ServiceHealth {
      service_name: name.to_string(),
      status: ServiceHealthStatus::Healthy,
      ..Default::default()
    }
  }

  fn with_status(
    name: &str,
    status: ServiceHealthStatus,
  ) -> ServiceHealth {
    ServiceHealth {
      service_name: name.to_string(),
      status,
      ..Default::default()
    }
  }

  fn details(
    running: bool,
    restart_count: u64,
    health: Option<ContainerHealthKind>,
  ) -> ContainerDetails {
    ContainerDetails {
      id: String::from("c1"),
      name: String::from("stack-web"),
      running,
      restart_count,
      health,
      ..Default::default()
    }
  }

  fn summary() -> ContainerSummary {
    ContainerSummary {
      id: String::from("c1"),
      name: String::from("stack-web"),
      ..Default::default()
    }
  }

  #[test]
  fn healthcheck_status_wins() {
    for (kind, expected) in [
      (ContainerHealthKind::Healthy, ServiceHealthStatus::Healthy),
      (
        ContainerHealthKind::Starting,
        ServiceHealthStatus::Starting,
      ),
      (
        ContainerHealthKind::Unhealthy,
        ServiceHealthStatus::Unhealthy,
      ),
    ] {
      let health = derive_service_health(
        "web",
        Some(&summary()),
        Some(&details(true, 0, Some(kind))),
        None,
      );
      assert_eq!(health.status, expected);
    }
  }

  #[test]
  fn no_healthcheck_uses_restart_stability() {
    let prev = ServiceHealth {
      service_name: String::from("web"),
      restart_count: 1,
      ..Default::default()
    };
    // Same restart count as last sample: stable.
    let stable = derive_service_health(
      "web",
      Some(&summary()),
      Some(&details(true, 1, None)),
      Some(&prev),
    );
    assert_eq!(stable.status, ServiceHealthStatus::Healthy);

    // Restarted since last sample.
    let restarted = derive_service_health(
      "web",
      Some(&summary()),
      Some(&details(true, 2, None)),
      Some(&prev),
    );
    assert_eq!(restarted.status, ServiceHealthStatus::Starting);

    // Not running at all.
    let dead = derive_service_health(
      "web",
      Some(&summary()),
      Some(&details(false, 2, None)),
      Some(&prev),
    );
    assert_eq!(dead.status, ServiceHealthStatus::Unhealthy);
  }

  #[test]
  fn missing_container_is_unknown() {
    let health = derive_service_health("web", None, None, None);
    assert_eq!(health.status, ServiceHealthStatus::Unknown);
    assert_eq!(
      health.reason.as_deref(),
      Some("container not found")
    );
  }

  #[test]
  fn overall_reduction() {
    assert_eq!(derive_overall(&[]), StackHealthStatus::Unknown);
    assert_eq!(
      derive_overall(&[healthy("a"), healthy("b")]),
      StackHealthStatus::Healthy
    );
    assert_eq!(
      derive_overall(&[
        healthy("a"),
        with_status("b", ServiceHealthStatus::Unhealthy)
      ]),
      StackHealthStatus::Unhealthy
    );
    assert_eq!(
      derive_overall(&[
        healthy("a"),
        with_status("b", ServiceHealthStatus::Starting)
      ]),
      StackHealthStatus::Degraded
    );
    assert_eq!(
      derive_overall(&[
        with_status("a", ServiceHealthStatus::Unknown),
        with_status("b", ServiceHealthStatus::Unknown)
      ]),
      StackHealthStatus::Unknown
    );
  }

  #[test]
  fn maintenance_and_operations_set_the_mode() {
    let mut deployment = Deployment {
      status: DeploymentStatus::Running,
      ..Default::default()
    };
    assert_eq!(
      operation_mode(&deployment),
      OperationMode::Normal
    );
    deployment.maintenance = true;
    assert_eq!(
      operation_mode(&deployment),
      OperationMode::Maintenance
    );
    deployment.status = DeploymentStatus::Upgrading;
    assert_eq!(
      operation_mode(&deployment),
      OperationMode::Upgrading
    );
    deployment.status = DeploymentStatus::RollingBack;
    assert_eq!(
      operation_mode(&deployment),
      OperationMode::RollingBack
    );
  }
}
