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

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;
use virtlink_config::resources::{BackingConfig, PoolType, ResourceType};
use virtlink_error::Error;

use crate::pool_connection::PoolConnection;
use crate::volume::{DirectoryVolumeBacking, NfsVolumeBacking};

/// Update-command names shared by the manager and every backing variant.
pub mod commands {
    pub const ALLOCATE: &str = "allocate";
    pub const RELEASE: &str = "release";
    pub const RESIZE: &str = "resize";
    pub const INFO: &str = "info";
}

/// Worker-local realization of one resource inside a pool. Every backing
/// belongs to exactly one pool connection, chosen at construction by the
/// `(pool type, resource type)` pair.
#[async_trait]
pub trait ResourceBacking: Send + Sync {
    /// Worker-generated id, fresh at creation and never reused.
    fn backing_id(&self) -> Uuid;

    fn resource_type(&self) -> ResourceType;

    fn pool_id(&self) -> &str;

    /// Commands `update` will dispatch. Anything else is
    /// `Code::Unimplemented`, distinct from a handler-level failure.
    fn update_commands(&self) -> Vec<&'static str>;

    /// Creation hook invoked once when the backing is registered. Directory
    /// volumes allocate eagerly here; other backends may defer physical
    /// allocation to an explicit `allocate` command.
    async fn create(&self) -> Result<(), Error>;

    /// Releases the resource per policy and clears the backing's identity
    /// fields, so accidental reuse after destroy fails observably.
    async fn destroy(&self) -> Result<(), Error>;

    /// Backend-specific update-command dispatch.
    async fn update(&self, command: &str, args: Value) -> Result<Value, Error>;

    /// Produces the descriptive config of a copy of this resource.
    async fn clone_resource(&self, args: Value) -> Result<Value, Error>;
}

/// Compile-time `(pool type, resource type)` registry. New backends are
/// added by extending this match.
pub fn backing_factory(
    pool: &Arc<dyn PoolConnection>,
    config: &BackingConfig,
    backing_id: Uuid,
) -> Result<Arc<dyn ResourceBacking>, Error> {
    match (pool.pool_type(), config.meta.resource_type) {
        (PoolType::Filesystem, ResourceType::Volume) => Ok(Arc::new(
            DirectoryVolumeBacking::new(pool.clone(), config, backing_id),
        )),
        (PoolType::Nfs, ResourceType::Volume) => Ok(Arc::new(NfsVolumeBacking::new(
            pool.clone(),
            config,
            backing_id,
        ))),
    }
}
