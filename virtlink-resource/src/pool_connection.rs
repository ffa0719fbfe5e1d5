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

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use virtlink_config::resources::{PoolConfig, PoolSpec, PoolType};
use virtlink_error::Error;

use crate::directory_pool::DirectoryPoolConnection;
use crate::mounter::Mounter;
use crate::nfs_pool::NfsPoolConnection;

/// One live handle to an open storage pool on this worker node. The
/// `ResourceManager` exclusively owns every connection's lifetime.
#[async_trait]
pub trait PoolConnection: Send + Sync {
    fn pool_id(&self) -> &str;

    fn pool_type(&self) -> PoolType;

    /// Resolved directory resources of this pool live under (the pool root
    /// or the mount point).
    fn root_path(&self) -> PathBuf;

    /// Opens the backend handle. Calling on an already-open connection is a
    /// no-op, not an error.
    async fn open(&self) -> Result<(), Error>;

    /// Closes the backend handle. Idempotent and tolerant of partial state.
    async fn close(&self) -> Result<(), Error>;

    /// Pure connectivity query. Variants whose backend can be torn down
    /// externally must re-query actual state here.
    async fn connected(&self) -> Result<bool, Error>;

    /// Diagnostic snapshot for the orchestrator.
    async fn info(&self) -> Result<Value, Error>;
}

/// Compile-time pool backend registry. New backends are added by extending
/// the match on the pool spec variant.
pub fn pool_connection_factory(
    config: &PoolConfig,
    mounter: &Arc<dyn Mounter>,
) -> Arc<dyn PoolConnection> {
    match &config.spec {
        PoolSpec::Directory(spec) => {
            Arc::new(DirectoryPoolConnection::new(config.meta.uuid.clone(), spec))
        }
        PoolSpec::Nfs(spec) => Arc::new(NfsPoolConnection::new(
            config.meta.uuid.clone(),
            spec.clone(),
            mounter.clone(),
        )),
    }
}
