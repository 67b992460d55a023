//! Stack source syncing through the fetcher seam.

mod common;

use async_trait::async_trait;
use rsgo_client::entities::source::{StackDefinition, StackSource};
use rsgo_core::sources::{SourceFetcher, sync_source};

use common::harness;

struct StaticFetcher {
  definitions: Vec<StackDefinition>,
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
  async fn fetch(
    &self,
    _source: &StackSource,
  ) -> anyhow::Result<Vec<StackDefinition>> {
    Ok(self.definitions.clone())
  }
}

fn definition(
  name: &str,
  version: &str,
  compose: &str,
) -> StackDefinition {
  StackDefinition {
    name: name.to_string(),
    version: version.to_string(),
    compose_template: compose.to_string(),
    ..Default::default()
  }
}

#[tokio::test]
async fn sync_publishes_and_annotates_definitions() {
  let h = harness().await;
  let source = StackSource {
    id: String::from("src1"),
    name: String::from("local catalog"),
    ..Default::default()
  };
  h.core
    .store
    .stack_sources
    .put(&source.id, &source)
    .await
    .unwrap();

  let fetcher = StaticFetcher {
    definitions: vec![
      definition(
        "blog",
        "1.0.0",
        "
services:
  migrate:
    image: migrator:1
    labels:
      rsgo.init.order: \"1\"
  web:
    image: blog:1
    depends_on: [db]
  db:
    image: postgres:16
",
      ),
      // Incomplete: no compose template, skipped by the sync.
      definition("broken", "1.0.0", ""),
    ],
  };

  let published =
    sync_source(&h.core, &fetcher, "src1").await.unwrap();
  assert_eq!(published, 1);

  let definitions =
    h.core.store.stack_definitions.list().await.unwrap();
  assert_eq!(definitions.len(), 1);
  let blog = &definitions[0];
  assert_eq!(blog.source_id, "src1");
  assert!(!blog.id.is_empty());
  // Services and init containers annotated from the template.
  assert_eq!(blog.services, vec!["db", "web"]);
  assert_eq!(blog.init_containers, vec!["migrate"]);

  let source = h
    .core
    .store
    .stack_sources
    .get("src1")
    .await
    .unwrap()
    .unwrap();
  assert!(source.last_synced_at > 0);
}

#[tokio::test]
async fn resync_replaces_wholesale() {
  let h = harness().await;
  let source = StackSource {
    id: String::from("src1"),
    name: String::from("local catalog"),
    ..Default::default()
  };
  h.core
    .store
    .stack_sources
    .put(&source.id, &source)
    .await
    .unwrap();

  let first = StaticFetcher {
    definitions: vec![
      definition("a", "1.0.0", "services:\n  a:\n    image: a:1\n"),
      definition("b", "1.0.0", "services:\n  b:\n    image: b:1\n"),
    ],
  };
  sync_source(&h.core, &first, "src1").await.unwrap();

  let second = StaticFetcher {
    definitions: vec![definition(
      "a",
      "2.0.0",
      "services:\n  a:\n    image: a:2\n",
    )],
  };
  sync_source(&h.core, &second, "src1").await.unwrap();

  let definitions =
    h.core.store.stack_definitions.list().await.unwrap();
  assert_eq!(definitions.len(), 1);
  assert_eq!(definitions[0].name, "a");
  assert_eq!(definitions[0].version, "2.0.0");
}

#[tokio::test]
async fn disabled_sources_do_not_sync() {
  let h = harness().await;
  let source = StackSource {
    id: String::from("src1"),
    name: String::from("local catalog"),
    enabled: false,
    ..Default::default()
  };
  h.core
    .store
    .stack_sources
    .put(&source.id, &source)
    .await
    .unwrap();

  let fetcher = StaticFetcher {
    definitions: vec![definition(
      "a",
      "1.0.0",
      "services:\n  a:\n    image: a:1\n",
    )],
  };
  let published =
    sync_source(&h.core, &fetcher, "src1").await.unwrap();
  assert_eq!(published, 0);
  assert!(
    h.core
      .store
      .stack_definitions
      .list()
      .await
      .unwrap()
      .is_empty()
  );
}
