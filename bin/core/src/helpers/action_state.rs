use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use cache::CloneCache;

/// Flags something can be busy on.
pub trait Busy {
  fn busy(&self) -> bool;
}

/// In-flight flags per deployment. At most one may be set; the
/// guard model below enforces it within this process, the status
/// compare-and-swap in the store enforces it across processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeploymentActionState {
  pub installing: bool,
  pub upgrading: bool,
  pub rolling_back: bool,
  pub removing: bool,
}

impl Busy for DeploymentActionState {
  fn busy(&self) -> bool {
    self.installing
      || self.upgrading
      || self.rolling_back
      || self.removing
  }
}

#[derive(Default)]
pub struct ActionStates {
  pub deployment:
    CloneCache<String, Arc<ActionState<DeploymentActionState>>>,
}

/// Need to be able to check "busy" with the lock acquired.
#[derive(Default)]
pub struct ActionState<States: Default + Send + 'static>(
  Mutex<States>,
);

impl<States: Default + Busy + Copy + Send + 'static>
  ActionState<States>
{
  /// Acquire the lock, fail if busy, otherwise apply `update_fn`.
  /// The returned guard owns the state handle so it can move
  /// into the spawned operation task, and resets the state to
  /// default on drop.
  pub fn update_owned(
    self: &Arc<Self>,
    update_fn: impl Fn(&mut States),
  ) -> anyhow::Result<OwnedUpdateGuard<States>> {
    let mut lock = self
      .0
      .lock()
      .map_err(|e| anyhow!("action state lock poisoned | {e:?}"))?;
    if lock.busy() {
      return Err(anyhow!("deployment is busy"));
    }
    update_fn(&mut lock);
    drop(lock);
    Ok(OwnedUpdateGuard(self.clone()))
  }
}

/// Returns the inner state to default when dropped. The inner
/// mutex guard is always released before this can drop.
pub struct OwnedUpdateGuard<States: Default + Send + 'static>(
  Arc<ActionState<States>>,
);

impl<States: Default + Send + 'static> Drop
  for OwnedUpdateGuard<States>
{
  fn drop(&mut self) {
    match self.0.0.lock() {
      Ok(mut lock) => *lock = Default::default(),
      Err(e) => {
        error!("CRITICAL: an action state lock is poisoned | {e:?}")
      }
    }
  }
}
