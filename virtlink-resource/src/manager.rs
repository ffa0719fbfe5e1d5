// Copyright 2024 The Virtlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;

use async_lock::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;
use virtlink_config::resources::{BackingConfig, PoolConfig, PoolId};
use virtlink_error::{Code, Error, ResultExt, make_err};

use crate::backing::{ResourceBacking, backing_factory};
use crate::mounter::{Mounter, SystemMounter};
use crate::pool_connection::{PoolConnection, pool_connection_factory};

#[derive(Default)]
struct ManagerState {
    pools: HashMap<PoolId, Arc<dyn PoolConnection>>,
    backings: HashMap<Uuid, Arc<dyn ResourceBacking>>,
}

/// Owns the pool-id to connection and backing-id to backing maps on one
/// worker node. One mutex guards both maps and is held across backend IO,
/// so two racing creates for the same pool id collapse to a single opened
/// connection.
pub struct ResourceManager {
    state: Mutex<ManagerState>,
    mounter: Arc<dyn Mounter>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::with_mounter(Arc::new(SystemMounter))
    }

    pub fn with_mounter(mounter: Arc<dyn Mounter>) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            mounter,
        }
    }

    pub async fn startup(&self) -> Result<(), Error> {
        let state = self.state.lock().await;
        if !state.pools.is_empty() || !state.backings.is_empty() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Resource manager started up with {} pools and {} backings still registered",
                state.pools.len(),
                state.backings.len()
            ));
        }
        tracing::info!("Resource manager ready");
        Ok(())
    }

    /// Releases every backing and closes every pool connection. Skipping
    /// teardown leaks connections and any lazily-held mounts.
    pub async fn teardown(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        for (backing_id, backing) in state.backings.drain() {
            if let Err(err) = backing.destroy().await {
                tracing::warn!(%backing_id, ?err, "Failed to destroy backing during teardown");
            }
        }
        for (pool_id, pool) in state.pools.drain() {
            if let Err(err) = pool.close().await {
                tracing::warn!(%pool_id, ?err, "Failed to close pool during teardown");
            }
        }
        tracing::info!("Resource manager idle");
        Ok(())
    }

    /// Opens a connection to the pool described by `config` and returns the
    /// connection info the orchestrator must persist (resolved root path or
    /// mount point). A second call for an already-connected pool id
    /// observes the existing connection and returns its info without
    /// touching the backend again.
    pub async fn create_pool_connection(&self, config: PoolConfig) -> Result<Value, Error> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.pools.get(&config.meta.uuid) {
            return existing
                .info()
                .await
                .err_tip(|| "While describing an already-open pool connection");
        }
        let pool = pool_connection_factory(&config, &self.mounter);
        pool.open()
            .await
            .err_tip(|| format!("Failed to open pool connection '{}'", config.meta.uuid))?;
        let info = pool.info().await?;
        state.pools.insert(config.meta.uuid.clone(), pool);
        Ok(info)
    }

    /// Closes and forgets the connection. Unknown pool ids are a no-op, so
    /// repeated destroys never raise.
    pub async fn destroy_pool_connection(&self, pool_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let Some(pool) = state.pools.remove(pool_id) else {
            tracing::debug!(%pool_id, "destroy_pool_connection for unknown pool, ignoring");
            return Ok(());
        };
        pool.close()
            .await
            .err_tip(|| format!("Failed to close pool connection '{pool_id}'"))
    }

    /// Binds a new backing to an already-open pool connection, runs its
    /// create hook and registers it under a freshly generated id.
    pub async fn create_backing_object(&self, config: BackingConfig) -> Result<Uuid, Error> {
        let mut state = self.state.lock().await;
        let pool = state
            .pools
            .get(&config.meta.pool)
            .err_tip_with_code(|_| {
                (
                    Code::FailedPrecondition,
                    format!(
                        "Pool connection '{}' is not open on this worker",
                        config.meta.pool
                    ),
                )
            })?
            .clone();
        let backing_id = Uuid::new_v4();
        let backing = backing_factory(&pool, &config, backing_id)?;
        backing
            .create()
            .await
            .err_tip(|| format!("Failed to create backing for resource '{}'", config.meta.uuid))?;
        state.backings.insert(backing.backing_id(), backing);
        tracing::info!(
            %backing_id,
            resource_id = %config.meta.uuid,
            pool_id = %config.meta.pool,
            "Backing created"
        );
        Ok(backing_id)
    }

    /// Destroys the backing and forgets its record. The backing id is never
    /// reissued; later operations against it report not-found.
    pub async fn destroy_backing_object(&self, backing_id: &Uuid) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let backing = state
            .backings
            .get(backing_id)
            .err_tip_with_code(|_| (Code::NotFound, format!("Unknown backing id {backing_id}")))?
            .clone();
        backing
            .destroy()
            .await
            .err_tip(|| format!("Failed to destroy backing {backing_id}"))?;
        state.backings.remove(backing_id);
        tracing::info!(%backing_id, "Backing destroyed");
        Ok(())
    }

    pub async fn clone_resource_by_backing(
        &self,
        backing_id: &Uuid,
        args: Value,
    ) -> Result<Value, Error> {
        let backing = self.get_backing(backing_id).await?;
        backing
            .clone_resource(args)
            .await
            .err_tip(|| format!("Failed to clone resource by backing {backing_id}"))
    }

    /// Looks up the backing's command table and invokes the matching
    /// handler. Unregistered commands surface as `Code::Unimplemented` so
    /// callers can tell "not supported" from "failed while doing it".
    pub async fn update_resource_by_backing(
        &self,
        backing_id: &Uuid,
        command: &str,
        args: Value,
    ) -> Result<Value, Error> {
        let backing = self.get_backing(backing_id).await?;
        if !backing.update_commands().iter().any(|c| *c == command) {
            return Err(make_err!(
                Code::Unimplemented,
                "Command '{command}' is not supported by {} backings in pool '{}'",
                backing.resource_type(),
                backing.pool_id()
            ));
        }
        backing.update(command, args).await
    }

    pub async fn pool_info(&self, pool_id: &str) -> Result<Value, Error> {
        let pool = {
            let state = self.state.lock().await;
            state
                .pools
                .get(pool_id)
                .err_tip_with_code(|_| (Code::NotFound, format!("Unknown pool id '{pool_id}'")))?
                .clone()
        };
        pool.info().await
    }

    pub async fn list_pools(&self) -> Result<Value, Error> {
        let pools: Vec<Arc<dyn PoolConnection>> = {
            let state = self.state.lock().await;
            state.pools.values().cloned().collect()
        };
        let mut infos = Vec::with_capacity(pools.len());
        for pool in pools {
            infos.push(pool.info().await?);
        }
        Ok(json!(infos))
    }

    async fn get_backing(&self, backing_id: &Uuid) -> Result<Arc<dyn ResourceBacking>, Error> {
        let state = self.state.lock().await;
        state
            .backings
            .get(backing_id)
            .err_tip_with_code(|_| (Code::NotFound, format!("Unknown backing id {backing_id}")))
            .cloned()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
