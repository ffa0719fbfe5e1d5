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
use serde_json::{Value, json};
use virtlink_config::resources::{NfsPoolSpec, PoolType};
use virtlink_error::{Error, ResultExt};

use crate::mounter::Mounter;
use crate::pool_connection::PoolConnection;

/// Pool backed by an NFS export mounted on the worker node. The mount can
/// be torn down externally, so `connected` always re-queries the mounter.
pub struct NfsPoolConnection {
    pool_id: String,
    spec: NfsPoolSpec,
    mount_point: PathBuf,
    mounter: Arc<dyn Mounter>,
}

impl NfsPoolConnection {
    pub fn new(pool_id: String, spec: NfsPoolSpec, mounter: Arc<dyn Mounter>) -> Self {
        let mount_point = PathBuf::from(&spec.mount_point);
        Self {
            pool_id,
            spec,
            mount_point,
            mounter,
        }
    }
}

#[async_trait]
impl PoolConnection for NfsPoolConnection {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn pool_type(&self) -> PoolType {
        PoolType::Nfs
    }

    fn root_path(&self) -> PathBuf {
        self.mount_point.clone()
    }

    async fn open(&self) -> Result<(), Error> {
        if self.mounter.is_mounted(&self.mount_point).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.mount_point)
            .await
            .err_tip(|| format!("Failed to create mount point {}", self.mount_point.display()))?;
        self.mounter
            .mount(
                &self.spec.mount_source(),
                &self.mount_point,
                "nfs",
                &self.spec.options,
            )
            .await
            .err_tip(|| format!("Failed to mount NFS pool '{}'", self.pool_id))?;
        tracing::info!(
            pool_id = %self.pool_id,
            source = %self.spec.mount_source(),
            mount_point = %self.mount_point.display(),
            "NFS pool mounted"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.mounter.is_mounted(&self.mount_point).await? {
            return Ok(());
        }
        self.mounter
            .unmount(&self.mount_point)
            .await
            .err_tip(|| format!("Failed to unmount NFS pool '{}'", self.pool_id))?;
        tracing::info!(pool_id = %self.pool_id, "NFS pool unmounted");
        Ok(())
    }

    async fn connected(&self) -> Result<bool, Error> {
        self.mounter.is_mounted(&self.mount_point).await
    }

    async fn info(&self) -> Result<Value, Error> {
        Ok(json!({
            "uuid": self.pool_id,
            "type": self.pool_type().to_string(),
            "source": self.spec.mount_source(),
            "mount_point": self.mount_point.display().to_string(),
            "options": self.spec.options,
            "connected": self.connected().await?,
        }))
    }
}
