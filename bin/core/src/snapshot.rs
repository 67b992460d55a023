//! Capture / restore of pre-change deployment state for rollback.

use rsgo_client::entities::{
  deployment::{Deployment, DeploymentStatus, OperationKind},
  new_id, rsgo_timestamp,
  snapshot::{Snapshot, SnapshotKind},
};

use crate::store::Collection;

/// Owns the snapshot namespace. The engine captures before every
/// mutating change and restores for rollback.
pub struct Snapshots {
  collection: Collection<Snapshot>,
}

impl Snapshots {
  pub fn new(collection: Collection<Snapshot>) -> Snapshots {
    Snapshots { collection }
  }

  /// Persist a snapshot, assigning id and capture time.
  ///
  /// A `PreUpgrade` capture supersedes the previous `PreUpgrade`
  /// snapshot of the same deployment, keeping exactly one active.
  /// The mutation that follows must not start until this returns.
  pub async fn capture(
    &self,
    mut snapshot: Snapshot,
  ) -> anyhow::Result<Snapshot> {
    snapshot.id = new_id();
    snapshot.captured_at = rsgo_timestamp();
    if snapshot.kind == SnapshotKind::PreUpgrade {
      for superseded in self
        .list_for(&snapshot.deployment_id)
        .await?
        .into_iter()
        .filter(|s| s.kind == SnapshotKind::PreUpgrade)
      {
        self.collection.delete(&superseded.id).await?;
      }
    }
    self.collection.put(&snapshot.id, &snapshot).await?;
    Ok(snapshot)
  }

  /// The snapshot a rollback would restore: the most recent
  /// `PreUpgrade` for the deployment.
  pub async fn restore(
    &self,
    deployment_id: &str,
  ) -> anyhow::Result<Option<Snapshot>> {
    Ok(
      self
        .list_for(deployment_id)
        .await?
        .into_iter()
        .find(|s| s.kind == SnapshotKind::PreUpgrade),
    )
  }

  /// Rollback is only offered for a deployment that failed an
  /// upgrade and has a matching snapshot.
  pub async fn can_rollback(
    &self,
    deployment: &Deployment,
  ) -> anyhow::Result<bool> {
    if deployment.status != DeploymentStatus::Failed
      || deployment.last_operation != Some(OperationKind::Upgrade)
    {
      return Ok(false);
    }
    Ok(self.restore(&deployment.id).await?.is_some())
  }

  /// All snapshots for a deployment, newest first.
  pub async fn list_for(
    &self,
    deployment_id: &str,
  ) -> anyhow::Result<Vec<Snapshot>> {
    let mut snapshots = self
      .collection
      .list()
      .await?
      .into_iter()
      .filter(|s| s.deployment_id == deployment_id)
      .collect::<Vec<_>>();
    snapshots.sort_by_key(|s| std::cmp::Reverse(s.captured_at));
    Ok(snapshots)
  }

  /// Deleting a deployment deletes its snapshots.
  pub async fn delete_for(
    &self,
    deployment_id: &str,
  ) -> anyhow::Result<()> {
    for snapshot in self.list_for(deployment_id).await? {
      self.collection.delete(&snapshot.id).await?;
    }
    Ok(())
  }
}
