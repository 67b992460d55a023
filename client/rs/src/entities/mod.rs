use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// [CoreConfig][config::CoreConfig].
pub mod config;
/// Subtypes of [Deployment][deployment::Deployment].
pub mod deployment;
/// Subtypes of [Environment][environment::Environment].
pub mod environment;
/// Per deployment health reporting types.
pub mod health;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// Progress events and init container log lines.
pub mod progress;
/// Subtypes of [RegistryCredential][registry::RegistryCredential].
pub mod registry;
/// Subtypes of [Snapshot][snapshot::Snapshot].
pub mod snapshot;
/// Stack sources, definitions and products.
pub mod source;

#[typeshare(serialized_as = "number")]
pub type I64 = i64;
#[typeshare(serialized_as = "any")]
pub type JsonValue = serde_json::Value;

/// Current timestamp in unix ms.
pub fn rsgo_timestamp() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

/// Fresh opaque id for any persisted record.
pub fn new_id() -> String {
  uuid::Uuid::new_v4().simple().to_string()
}

/// Labels the engine writes onto every container it creates.
/// The health monitor and remove path correlate by these.
pub mod labels {
  pub const DEPLOYMENT: &str = "rsgo.deployment";
  pub const STACK: &str = "rsgo.stack";
  pub const SERVICE: &str = "rsgo.service";
  pub const MANAGED: &str = "rsgo.managed";
  pub const VERSION: &str = "rsgo.version";
  /// Marks a compose service as an init container, with run order.
  pub const INIT_ORDER: &str = "rsgo.init.order";
  /// `abort` (default) or `continue`.
  pub const INIT_FAILURE_POLICY: &str = "rsgo.init.failurePolicy";
}

/// Represents an empty json object: `{}`
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct NoData {}

/// Value shown in place of secret variable values
/// in persisted configuration and API responses.
pub const SECRET_MASK: &str = "***";
