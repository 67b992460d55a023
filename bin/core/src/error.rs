use uuid::Uuid;

/// The operational failure taxonomy surfaced to callers.
///
/// These are expected outcomes, carried as values through the
/// engine. Panics are reserved for programming invariants.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
  /// Caller-correctable input problem. Surfaced verbatim.
  #[error("{0}")]
  Validation(String),

  /// The environment's daemon could not be reached.
  /// The operation fails immediately with no partial persistence.
  #[error("docker daemon unavailable: {0}")]
  DockerUnavailable(String),

  #[error("failed to pull image {image}: {cause}")]
  ImagePullFailed { image: String, cause: String },

  #[error(
    "init container {service} exited with code {exit_code}"
  )]
  InitContainerFailed { service: String, exit_code: i64 },

  #[error("service {service} did not become healthy in time")]
  ServiceStartTimeout { service: String },

  /// Pre-flight plan rejection. No state was changed.
  #[error("invalid plan: {0}")]
  PlanInvalid(String),

  /// Another mutating operation holds this deployment.
  #[error("an operation is already in progress for {deployment}")]
  OperationInProgress { deployment: String },

  #[error("no snapshot available for rollback")]
  NoSnapshot,

  #[error("{kind} {id} not found")]
  NotFound { kind: &'static str, id: String },

  /// The requested transition is not legal from the current state.
  #[error("invalid state: {0}")]
  InvalidState(String),

  /// Anything else. Carries a correlation id for log lookup.
  #[error("internal error ({correlation}): {source:#}")]
  Internal {
    correlation: Uuid,
    #[source]
    source: anyhow::Error,
  },
}

impl ExecuteError {
  pub fn internal(source: anyhow::Error) -> ExecuteError {
    let correlation = Uuid::new_v4();
    error!("internal error {correlation} | {source:#}");
    ExecuteError::Internal {
      correlation,
      source,
    }
  }

  pub fn not_found(
    kind: &'static str,
    id: impl Into<String>,
  ) -> ExecuteError {
    ExecuteError::NotFound {
      kind,
      id: id.into(),
    }
  }

  pub fn validation(msg: impl Into<String>) -> ExecuteError {
    ExecuteError::Validation(msg.into())
  }

  /// The reason string persisted on `last_failure_reason` and
  /// published on the terminal progress event.
  pub fn failure_reason(&self) -> String {
    self.to_string()
  }
}

pub type ExecuteResult<T> = Result<T, ExecuteError>;
