//! Stack source syncing. Fetch mechanics (git clone, directory
//! walk, catalog download) live behind [SourceFetcher]; the core
//! validates and publishes whatever the fetcher enumerates.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rsgo_client::entities::{
  new_id, rsgo_timestamp,
  source::{StackDefinition, StackSource},
};
use variables::Renderer;

use crate::state::Core;

#[async_trait]
pub trait SourceFetcher: Send + Sync + 'static {
  /// Enumerate the raw definition documents of a source.
  /// Returned definitions carry no ids; the sync assigns them.
  async fn fetch(
    &self,
    source: &StackSource,
  ) -> anyhow::Result<Vec<StackDefinition>>;
}

/// Re-sync one source: fetch, validate, and replace the source's
/// published definitions wholesale. Published definitions are
/// immutable between syncs.
pub async fn sync_source(
  core: &Arc<Core>,
  fetcher: &dyn SourceFetcher,
  source_id: &str,
) -> anyhow::Result<usize> {
  let mut source = core
    .store
    .stack_sources
    .get(source_id)
    .await?
    .with_context(|| format!("no stack source {source_id}"))?;
  if !source.enabled {
    return Ok(0);
  }

  let fetched = fetcher
    .fetch(&source)
    .await
    .with_context(|| format!("sync failed for {}", source.name))?;

  let mut published = Vec::with_capacity(fetched.len());
  for mut definition in fetched {
    if definition.name.is_empty()
      || definition.version.is_empty()
      || definition.compose_template.is_empty()
    {
      warn!(
        "skipping incomplete definition from source {}",
        source.name
      );
      continue;
    }
    definition.id = new_id();
    definition.source_id = source.id.clone();
    annotate_services(&mut definition);
    published.push(definition);
  }

  // Replace wholesale: everything previously published by this
  // source goes away.
  let existing = core.store.stack_definitions.list().await?;
  for stale in existing
    .iter()
    .filter(|d| d.source_id == source.id)
  {
    core.store.stack_definitions.delete(&stale.id).await?;
  }
  for definition in &published {
    core
      .store
      .stack_definitions
      .put(&definition.id, definition)
      .await?;
  }

  source.last_synced_at = rsgo_timestamp();
  core
    .store
    .stack_sources
    .put(&source.id, &source)
    .await?;

  info!(
    "synced source {}: {} definitions published",
    source.name,
    published.len()
  );
  Ok(published.len())
}

/// Best-effort service / init container listing, from a render
/// with declared defaults. Templates whose required variables
/// have no defaults keep whatever the manifest declared.
fn annotate_services(definition: &mut StackDefinition) {
  let defaults = definition.default_values();
  let Ok(compose) = Renderer::new(&defaults)
    .render(&definition.compose_template)
  else {
    return;
  };
  let Ok(plan) = crate::plan::plan(&compose, &[]) else {
    return;
  };
  definition.services =
    plan.services.iter().map(|s| s.name.clone()).collect();
  definition.init_containers = plan
    .init_containers
    .iter()
    .map(|i| i.node.name.clone())
    .collect();
}
