use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use rsgo_core::{
  config::load_config,
  docker::BollardConnector,
  monitor, startup,
  state::Core,
  store::MemoryStore,
};

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = load_config()?;
  logger::init(&config.logging)?;

  info!(
    "ReadyStackGo Core version: v{}",
    env!("CARGO_PKG_VERSION")
  );

  // The bundled store keeps metadata in process memory; durable
  // backends plug in through the same KvStore contract.
  let core = Core::new(
    config,
    Arc::new(MemoryStore::new()),
    Arc::new(BollardConnector::default()),
  );

  // Sweep operations that died with the previous process, then
  // reconcile health once before the loops take over.
  startup::on_startup(&core).await;

  monitor::spawn_monitor(core.clone());
  core.bus.spawn_retention_sweep();

  info!("ReadyStackGo Core running");
  futures_util::future::pending::<()>().await;
  Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )
  .context("failed to listen for SIGTERM")?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
