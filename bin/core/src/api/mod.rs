//! The method-level API surface the core exposes. Transports
//! (HTTP, streaming) are external collaborators fanning in to
//! [ExecuteRequest] / [ReadRequest] and out of the progress bus.

use std::sync::Arc;

use anyhow::Context;
use derive_variants::EnumVariants;
use resolver_api::Resolve;
use rsgo_client::api::{execute::*, read::*};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::state::Core;

mod execute;
mod read;

pub struct ExecuteArgs {
  pub core: Arc<Core>,
}

pub struct ReadArgs {
  pub core: Arc<Core>,
}

/// Every mutating request the core accepts.
#[derive(
  Debug, Clone, Serialize, Deserialize, EnumVariants,
)]
#[variant_derive(Debug, Clone, Copy, Display)]
#[serde(tag = "type", content = "params")]
pub enum ExecuteRequest {
  // ==== STACK ====
  DeployStack(DeployStack),
  UpgradeStack(UpgradeStack),
  RollbackStack(RollbackStack),
  RemoveStack(RemoveStack),
  MarkAsFailed(MarkAsFailed),

  // ==== PRODUCT ====
  DeployProduct(DeployProduct),
  UpgradeProduct(UpgradeProduct),
  RemoveProduct(RemoveProduct),

  // ==== MAINTENANCE ====
  EnterMaintenance(EnterMaintenance),
  ExitMaintenance(ExitMaintenance),
}

impl ExecuteRequest {
  /// Resolve against the wired core, serializing the typed
  /// response for the transport layer.
  pub async fn resolve(
    self,
    args: &ExecuteArgs,
  ) -> serror::Result<Value> {
    match self {
      ExecuteRequest::DeployStack(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::UpgradeStack(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::RollbackStack(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::RemoveStack(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::MarkAsFailed(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::DeployProduct(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::UpgradeProduct(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::RemoveProduct(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::EnterMaintenance(req) => {
        to_value(req.resolve(args).await?)
      }
      ExecuteRequest::ExitMaintenance(req) => {
        to_value(req.resolve(args).await?)
      }
    }
  }
}

/// Every read request the core accepts.
#[derive(
  Debug, Clone, Serialize, Deserialize, EnumVariants,
)]
#[variant_derive(Debug, Clone, Copy, Display)]
#[serde(tag = "type", content = "params")]
pub enum ReadRequest {
  GetStackHealth(GetStackHealth),
  GetDeployment(GetDeployment),
  ListDeployments(ListDeployments),
  ListSnapshots(ListSnapshots),
  CanRollback(CanRollback),
}

impl ReadRequest {
  pub async fn resolve(
    self,
    args: &ReadArgs,
  ) -> serror::Result<Value> {
    match self {
      ReadRequest::GetStackHealth(req) => {
        to_value(req.resolve(args).await?)
      }
      ReadRequest::GetDeployment(req) => {
        to_value(req.resolve(args).await?)
      }
      ReadRequest::ListDeployments(req) => {
        to_value(req.resolve(args).await?)
      }
      ReadRequest::ListSnapshots(req) => {
        to_value(req.resolve(args).await?)
      }
      ReadRequest::CanRollback(req) => {
        to_value(req.resolve(args).await?)
      }
    }
  }
}

fn to_value<T: Serialize>(response: T) -> serror::Result<Value> {
  Ok(
    serde_json::to_value(response)
      .context("failed to serialize response")?,
  )
}
