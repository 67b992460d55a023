//! Normalizes rendered compose text into an executable service
//! plan: ordered service nodes, init containers, dependency
//! layers. Parsing only; nothing here touches the daemon.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use rsgo_client::entities::labels;

use crate::docker::{HealthcheckSpec, PortSpec};

mod compose;

use compose::{ComposeFile, ComposeService};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
  #[error("compose parse error: {0}")]
  Yaml(String),

  #[error("service {service} has no image")]
  MissingImage { service: String },

  #[error("cycle at {service}")]
  Cycle { service: String },

  #[error("port {port} used by {first} and {second}")]
  PortCollision {
    port: u16,
    first: String,
    second: String,
  },

  #[error("host path {path} not permitted for service {service}")]
  PathNotPermitted { path: String, service: String },

  #[error(
    "init container {service} declares restart policy '{restart}' (must be 'no')"
  )]
  InitRestartPolicy { service: String, restart: String },

  #[error("invalid {label} label on {service}: {value}")]
  InvalidInitLabel {
    service: String,
    label: &'static str,
    value: String,
  },

  #[error("service {service} depends on unknown service {dependency}")]
  UnknownDependency {
    service: String,
    dependency: String,
  },

  #[error("invalid port spec '{spec}' on service {service}")]
  InvalidPort { service: String, spec: String },
}

/// The normalized output of the planner.
#[derive(Debug, Clone, Default)]
pub struct ServicePlan {
  /// Main services in dependency order.
  pub services: Vec<ServiceNode>,
  /// Init containers in ascending run order.
  pub init_containers: Vec<InitNode>,
  /// Service names grouped into start layers. Services within a
  /// layer are independent; layers run strictly in sequence.
  pub layers: Vec<Vec<String>>,
  /// Named volumes the stack owns.
  pub volumes: Vec<String>,
}

impl ServicePlan {
  pub fn service(&self, name: &str) -> Option<&ServiceNode> {
    self.services.iter().find(|s| s.name == name)
  }

  /// Every distinct image referenced by the plan, init containers
  /// included, in first-use order.
  pub fn images(&self) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut images = Vec::new();
    let init = self.init_containers.iter().map(|i| &i.node);
    for node in init.chain(self.services.iter()) {
      if seen.insert(node.image.clone()) {
        images.push(node.image.clone());
      }
    }
    images
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceNode {
  pub name: String,
  pub image: String,
  /// `KEY=value` pairs in declaration order.
  pub env: Vec<String>,
  pub ports: Vec<PortSpec>,
  pub depends_on: Vec<String>,
  pub healthcheck: Option<HealthcheckSpec>,
  pub labels: HashMap<String, String>,
  /// Docker restart policy name. Empty means `no`.
  pub restart: String,
  /// Validated `source:target[:opts]` mount specs.
  pub binds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitNode {
  pub order: i64,
  pub failure_policy: FailurePolicy,
  pub node: ServiceNode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
  /// A non-zero exit fails the whole operation.
  #[default]
  Abort,
  /// A non-zero exit is recorded and the operation proceeds.
  Continue,
}

/// Parse rendered compose text into a [ServicePlan].
///
/// Rejects dependency cycles, host port collisions, bind mounts
/// outside `allowed_volume_roots`, and init containers with a
/// restart policy other than `no`.
pub fn plan(
  compose: &str,
  allowed_volume_roots: &[String],
) -> Result<ServicePlan, PlanError> {
  let file: ComposeFile = serde_yaml_ng::from_str(compose)
    .map_err(|e| PlanError::Yaml(e.to_string()))?;

  let mut init_containers = Vec::new();
  let mut mains: IndexMap<String, ServiceNode> = IndexMap::new();

  for (name, service) in &file.services {
    let node =
      build_node(name, service, allowed_volume_roots)?;
    match init_spec(name, service, &node)? {
      Some((order, failure_policy)) => {
        init_containers.push(InitNode {
          order,
          failure_policy,
          node,
        });
      }
      None => {
        mains.insert(name.clone(), node);
      }
    }
  }

  init_containers.sort_by_key(|init| init.order);

  check_port_collisions(
    init_containers
      .iter()
      .map(|i| &i.node)
      .chain(mains.values()),
  )?;

  // depends_on entries pointing at init containers are dropped:
  // init containers always complete before any main starts.
  let init_names = init_containers
    .iter()
    .map(|i| i.node.name.clone())
    .collect::<HashSet<_>>();
  for node in mains.values_mut() {
    node.depends_on.retain(|dep| !init_names.contains(dep));
  }
  for (name, node) in &mains {
    for dependency in &node.depends_on {
      if !file.services.contains_key(dependency) {
        return Err(PlanError::UnknownDependency {
          service: name.clone(),
          dependency: dependency.clone(),
        });
      }
    }
  }

  let (ordered, layers) = order_services(&mains)?;

  let mut volumes = file
    .volumes
    .keys()
    .cloned()
    .collect::<Vec<_>>();
  // Named mount sources used without a top level declaration
  // still belong to the stack. Host paths (absolute or relative)
  // are bind mounts, not volumes.
  for node in mains.values().chain(init_containers.iter().map(|i| &i.node)) {
    for bind in &node.binds {
      let source =
        bind.split(':').next().unwrap_or_default();
      if !source.starts_with('/')
        && !source.starts_with('.')
        && !volumes.iter().any(|v| v == source)
      {
        volumes.push(source.to_string());
      }
    }
  }

  let services = ordered
    .into_iter()
    .map(|name| mains.shift_remove(&name).expect("ordered from mains"))
    .collect();

  Ok(ServicePlan {
    services,
    init_containers,
    layers,
    volumes,
  })
}

fn build_node(
  name: &str,
  service: &ComposeService,
  allowed_volume_roots: &[String],
) -> Result<ServiceNode, PlanError> {
  let image = service.image.clone().filter(|i| !i.is_empty()).ok_or(
    PlanError::MissingImage {
      service: name.to_string(),
    },
  )?;

  let mut ports = Vec::new();
  for spec in service.ports.entries() {
    let port =
      parse_port(&spec).ok_or_else(|| PlanError::InvalidPort {
        service: name.to_string(),
        spec: spec.clone(),
      })?;
    ports.push(port);
  }

  let mut binds = Vec::new();
  for volume in service.volumes.entries() {
    let source =
      volume.split(':').next().unwrap_or_default().to_string();
    // Only absolute host paths are policy checked. Relative and
    // named sources pass through untouched.
    if source.starts_with('/') {
      let permitted = allowed_volume_roots
        .iter()
        .any(|root| source.starts_with(root.as_str()));
      if !permitted {
        return Err(PlanError::PathNotPermitted {
          path: source,
          service: name.to_string(),
        });
      }
    }
    binds.push(volume);
  }

  Ok(ServiceNode {
    name: name.to_string(),
    image,
    env: service.environment.entries(),
    ports,
    depends_on: service.depends_on.services(),
    healthcheck: service
      .healthcheck
      .as_ref()
      .and_then(|check| check.to_spec()),
    labels: service.labels.map(),
    restart: service.restart.clone().unwrap_or_default(),
    binds,
  })
}

/// Init annotation from the `rsgo.init.*` labels, if present.
fn init_spec(
  name: &str,
  service: &ComposeService,
  node: &ServiceNode,
) -> Result<Option<(i64, FailurePolicy)>, PlanError> {
  let Some(order) = node.labels.get(labels::INIT_ORDER) else {
    return Ok(None);
  };
  let order: i64 =
    order
      .parse()
      .map_err(|_| PlanError::InvalidInitLabel {
        service: name.to_string(),
        label: labels::INIT_ORDER,
        value: order.clone(),
      })?;

  let restart = service.restart.clone().unwrap_or_default();
  if !restart.is_empty() && restart != "no" {
    return Err(PlanError::InitRestartPolicy {
      service: name.to_string(),
      restart,
    });
  }

  let failure_policy =
    match node.labels.get(labels::INIT_FAILURE_POLICY) {
      None => FailurePolicy::Abort,
      Some(policy) => match policy.as_str() {
        "abort" => FailurePolicy::Abort,
        "continue" => FailurePolicy::Continue,
        other => {
          return Err(PlanError::InvalidInitLabel {
            service: name.to_string(),
            label: labels::INIT_FAILURE_POLICY,
            value: other.to_string(),
          });
        }
      },
    };

  Ok(Some((order, failure_policy)))
}

fn check_port_collisions<'a>(
  nodes: impl Iterator<Item = &'a ServiceNode>,
) -> Result<(), PlanError> {
  let mut owners: HashMap<u16, &'a str> = HashMap::new();
  for node in nodes {
    for port in &node.ports {
      if let Some(first) = owners.get(&port.host) {
        return Err(PlanError::PortCollision {
          port: port.host,
          first: first.to_string(),
          second: node.name.clone(),
        });
      }
      owners.insert(port.host, node.name.as_str());
    }
  }
  Ok(())
}

/// Kahn's algorithm over `depends_on`, keeping declaration order
/// within each layer. Returns the flat start order plus the
/// parallelizable layers.
fn order_services(
  services: &IndexMap<String, ServiceNode>,
) -> Result<(Vec<String>, Vec<Vec<String>>), PlanError> {
  let mut remaining: IndexMap<&str, HashSet<&str>> = services
    .iter()
    .map(|(name, node)| {
      (
        name.as_str(),
        node
          .depends_on
          .iter()
          .map(String::as_str)
          .collect::<HashSet<_>>(),
      )
    })
    .collect();

  let mut order = Vec::new();
  let mut layers = Vec::new();
  let mut done: HashSet<&str> = HashSet::new();

  while !remaining.is_empty() {
    let ready = remaining
      .iter()
      .filter(|(_, deps)| deps.iter().all(|d| done.contains(d)))
      .map(|(name, _)| name.to_string())
      .collect::<Vec<_>>();
    if ready.is_empty() {
      // Every remaining service waits on another remaining one.
      let service = remaining
        .keys()
        .next()
        .expect("remaining is non-empty")
        .to_string();
      return Err(PlanError::Cycle { service });
    }
    for name in &ready {
      remaining.shift_remove(name.as_str());
    }
    for name in &ready {
      let (key, _) = services
        .get_key_value(name.as_str())
        .expect("ready came from services");
      done.insert(key.as_str());
    }
    order.extend(ready.clone());
    layers.push(ready);
  }

  Ok((order, layers))
}

/// `host:container[/proto]` or `container` (host ephemeral ports
/// are not supported: every published port is explicit).
fn parse_port(spec: &str) -> Option<PortSpec> {
  let (spec, protocol) = match spec.split_once('/') {
    Some((spec, proto)) => (spec, proto.to_string()),
    None => (spec, String::from("tcp")),
  };
  let (host, container) = spec.split_once(':')?;
  Some(PortSpec {
    host: host.parse().ok()?,
    container: container.parse().ok()?,
    protocol,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  const WEB_DB: &str = "
services:
  web:
    image: nginx:alpine
    ports:
      - 8080:80
    depends_on:
      - db
    environment:
      DB_HOST: db
  db:
    image: postgres:16
    environment:
      - POSTGRES_PASSWORD=secret
    healthcheck:
      test: [\"CMD\", \"pg_isready\"]
      interval: 10s
      retries: 3
volumes:
  pgdata:
";

  #[test]
  fn orders_services_by_dependency() {
    let plan = plan(WEB_DB, &[]).unwrap();
    let names = plan
      .services
      .iter()
      .map(|s| s.name.as_str())
      .collect::<Vec<_>>();
    assert_eq!(names, ["db", "web"]);
    assert_eq!(plan.layers, vec![vec!["db"], vec!["web"]]);
    assert_eq!(plan.volumes, vec!["pgdata"]);
  }

  #[test]
  fn normalizes_env_ports_and_healthcheck() {
    let plan = plan(WEB_DB, &[]).unwrap();
    let web = plan.service("web").unwrap();
    assert_eq!(web.env, vec!["DB_HOST=db"]);
    assert_eq!(
      web.ports,
      vec![PortSpec {
        host: 8080,
        container: 80,
        protocol: "tcp".into()
      }]
    );
    let db = plan.service("db").unwrap();
    assert_eq!(db.env, vec!["POSTGRES_PASSWORD=secret"]);
    let check = db.healthcheck.as_ref().unwrap();
    assert_eq!(check.test, vec!["CMD", "pg_isready"]);
    assert_eq!(check.interval_secs, Some(10));
    assert_eq!(check.retries, Some(3));
  }

  #[test]
  fn detects_cycles() {
    let compose = "
services:
  a:
    image: x
    depends_on: [b]
  b:
    image: y
    depends_on: [a]
";
    let err = plan(compose, &[]).unwrap_err();
    assert!(matches!(err, PlanError::Cycle { .. }));
    assert!(err.to_string().starts_with("cycle at "));
  }

  #[test]
  fn detects_port_collisions() {
    let compose = "
services:
  a:
    image: x
    ports: [\"8080:80\"]
  b:
    image: y
    ports: [\"8080:81\"]
";
    let err = plan(compose, &[]).unwrap_err();
    assert_eq!(
      err,
      PlanError::PortCollision {
        port: 8080,
        first: "a".into(),
        second: "b".into()
      }
    );
    assert_eq!(err.to_string(), "port 8080 used by a and b");
  }

  #[test]
  fn discovers_init_containers_in_order() {
    let compose = "
services:
  migrate:
    image: migrator:1
    labels:
      rsgo.init.order: \"2\"
      rsgo.init.failurePolicy: continue
  seed:
    image: seeder:1
    labels:
      - rsgo.init.order=1
  app:
    image: app:1
";
    let plan = plan(compose, &[]).unwrap();
    let orders = plan
      .init_containers
      .iter()
      .map(|i| (i.node.name.as_str(), i.order, i.failure_policy))
      .collect::<Vec<_>>();
    assert_eq!(
      orders,
      vec![
        ("seed", 1, FailurePolicy::Abort),
        ("migrate", 2, FailurePolicy::Continue),
      ]
    );
    assert_eq!(plan.services.len(), 1);
  }

  #[test]
  fn init_restart_policy_must_be_no() {
    let compose = "
services:
  migrate:
    image: migrator:1
    restart: always
    labels:
      rsgo.init.order: \"1\"
";
    let err = plan(compose, &[]).unwrap_err();
    assert!(matches!(err, PlanError::InitRestartPolicy { .. }));
  }

  #[test]
  fn rejects_host_paths_outside_allow_list() {
    let compose = "
services:
  app:
    image: app:1
    volumes:
      - /etc/passwd:/target
";
    let err = plan(compose, &[]).unwrap_err();
    assert!(matches!(err, PlanError::PathNotPermitted { .. }));

    let ok = plan(
      "
services:
  app:
    image: app:1
    volumes:
      - /srv/data/app:/data
      - appdata:/var/lib/app
",
      &[String::from("/srv/data")],
    )
    .unwrap();
    assert_eq!(
      ok.service("app").unwrap().binds,
      vec!["/srv/data/app:/data", "appdata:/var/lib/app"]
    );
    assert_eq!(ok.volumes, vec!["appdata"]);
  }

  #[test]
  fn relative_bind_sources_are_not_policy_checked() {
    // Relative sources are ordinary bind mounts: no allow-list
    // applies and they are not treated as named volumes.
    let plan = plan(
      "
services:
  app:
    image: app:1
    volumes:
      - ./data:/data
      - ../shared:/shared:ro
",
      &[],
    )
    .unwrap();
    assert_eq!(
      plan.service("app").unwrap().binds,
      vec!["./data:/data", "../shared:/shared:ro"]
    );
    assert!(plan.volumes.is_empty());
  }

  #[test]
  fn unknown_dependency_is_rejected() {
    let compose = "
services:
  app:
    image: app:1
    depends_on: [ghost]
";
    let err = plan(compose, &[]).unwrap_err();
    assert!(matches!(err, PlanError::UnknownDependency { .. }));
  }

  #[test]
  fn depends_on_map_form_and_parallel_layers() {
    let compose = "
services:
  proxy:
    image: proxy:1
    depends_on:
      api:
        condition: service_started
      worker:
        condition: service_started
  api:
    image: api:1
  worker:
    image: worker:1
";
    let plan = plan(compose, &[]).unwrap();
    assert_eq!(
      plan.layers,
      vec![vec!["api", "worker"], vec!["proxy"]]
    );
  }

  #[test]
  fn images_are_deduped_in_first_use_order() {
    let compose = "
services:
  a:
    image: shared:1
  b:
    image: shared:1
  c:
    image: other:2
";
    let plan = plan(compose, &[]).unwrap();
    assert_eq!(plan.images(), vec!["shared:1", "other:2"]);
  }
}
