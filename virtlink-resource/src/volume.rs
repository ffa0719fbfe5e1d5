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
use parking_lot::RwLock;
use serde_json::{Value, json};
use uuid::Uuid;
use virtlink_config::resources::{BackingConfig, ResourceType};
use virtlink_config::serde_utils::parse_data_size;
use virtlink_error::{Code, Error, ResultExt, make_err};

use crate::backing::{ResourceBacking, commands};
use crate::pool_connection::PoolConnection;

/// Identity fields cleared on destroy. Any operation attempted afterwards
/// observes the cleared state and fails instead of resurrecting the file.
struct VolumeIdentity {
    resource_id: String,
    path: PathBuf,
}

/// Shared file-volume behavior: a pre-sized file inside the pool's resolved
/// root directory.
struct FileVolume {
    backing_id: Uuid,
    pool: Arc<dyn PoolConnection>,
    identity: RwLock<Option<VolumeIdentity>>,
    requested_size: u64,
}

impl FileVolume {
    fn new(pool: Arc<dyn PoolConnection>, config: &BackingConfig, backing_id: Uuid) -> Self {
        let path = pool.root_path().join(&config.spec.filename);
        Self {
            backing_id,
            pool,
            identity: RwLock::new(Some(VolumeIdentity {
                resource_id: config.meta.uuid.clone(),
                path,
            })),
            requested_size: config.spec.size,
        }
    }

    fn identity(&self) -> Result<(String, PathBuf), Error> {
        let identity = self.identity.read();
        let identity = identity.as_ref().ok_or_else(|| {
            make_err!(
                Code::FailedPrecondition,
                "Backing {} was destroyed and must not be reused",
                self.backing_id
            )
        })?;
        Ok((identity.resource_id.clone(), identity.path.clone()))
    }

    async fn ensure_pool_connected(&self) -> Result<(), Error> {
        if !self.pool.connected().await? {
            return Err(make_err!(
                Code::Unavailable,
                "Pool '{}' is not connected",
                self.pool.pool_id()
            ));
        }
        Ok(())
    }

    async fn allocate(&self) -> Result<Value, Error> {
        let (_, path) = self.identity()?;
        self.ensure_pool_connected().await?;
        let file = tokio::fs::File::create(&path)
            .await
            .err_tip(|| format!("Failed to create volume file {}", path.display()))?;
        file.set_len(self.requested_size)
            .await
            .err_tip(|| format!("Failed to pre-size volume file {}", path.display()))?;
        tracing::info!(
            backing_id = %self.backing_id,
            path = %path.display(),
            size = self.requested_size,
            "Volume allocated"
        );
        self.info().await
    }

    async fn release(&self) -> Result<Value, Error> {
        let (_, path) = self.identity()?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(backing_id = %self.backing_id, path = %path.display(), "Volume released");
            }
            // Releasing an already-absent volume is idempotent.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(backing_id = %self.backing_id, "Volume already absent on release");
            }
            Err(err) => {
                return Err(Error::from(err)
                    .append(format!("Failed to release volume {}", path.display())));
            }
        }
        self.info().await
    }

    async fn resize(&self, args: &Value) -> Result<Value, Error> {
        let (_, path) = self.identity()?;
        let new_size = size_from_args(args)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .err_tip_with_code(|e| {
                (
                    e.code,
                    format!("Failed to open volume {} for resize", path.display()),
                )
            })?;
        file.set_len(new_size)
            .await
            .err_tip(|| format!("Failed to resize volume {}", path.display()))?;
        self.info().await
    }

    async fn info(&self) -> Result<Value, Error> {
        let (resource_id, path) = self.identity()?;
        let (allocated, size) = match tokio::fs::metadata(&path).await {
            Ok(metadata) => (true, metadata.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (false, 0),
            Err(err) => return Err(err.into()),
        };
        Ok(json!({
            "uuid": resource_id,
            "backing_id": self.backing_id.to_string(),
            "pool": self.pool.pool_id(),
            "path": path.display().to_string(),
            "allocated": allocated,
            "size": size,
        }))
    }

    async fn destroy(&self) -> Result<(), Error> {
        self.release().await?;
        // Clearing identity makes any later use of this backing fail with
        // FailedPrecondition instead of silently recreating state.
        *self.identity.write() = None;
        Ok(())
    }

    async fn clone_resource(&self, args: Value) -> Result<Value, Error> {
        let (_, path) = self.identity()?;
        let filename = args
            .get("filename")
            .and_then(Value::as_str)
            .ok_or_else(|| make_err!(Code::InvalidArgument, "Clone requires a 'filename'"))?;
        let clone_uuid = args
            .get("uuid")
            .and_then(Value::as_str)
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let clone_path = self.pool.root_path().join(filename);
        let size = match tokio::fs::metadata(&path).await {
            Ok(metadata) => {
                tokio::fs::copy(&path, &clone_path)
                    .await
                    .err_tip(|| format!("Failed to clone volume into {}", clone_path.display()))?;
                metadata.len()
            }
            // Cloning an unallocated volume only clones the spec.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => self.requested_size,
            Err(err) => return Err(err.into()),
        };
        Ok(json!({
            "meta": {
                "uuid": clone_uuid,
                "pool": self.pool.pool_id(),
                "allocated": clone_path.exists(),
                "type": ResourceType::Volume.to_string(),
            },
            "spec": {
                "filename": filename,
                "size": size,
            },
        }))
    }

    async fn update(&self, command: &str, args: Value) -> Result<Value, Error> {
        match command {
            commands::ALLOCATE => self.allocate().await,
            commands::RELEASE => self.release().await,
            commands::RESIZE => self.resize(&args).await,
            commands::INFO => self.info().await,
            _ => Err(make_err!(
                Code::Unimplemented,
                "Command '{command}' is not supported by {} backings",
                ResourceType::Volume
            )),
        }
    }
}

fn size_from_args(args: &Value) -> Result<u64, Error> {
    let size = args
        .get("size")
        .ok_or_else(|| make_err!(Code::InvalidArgument, "Missing 'size' argument"))?;
    if let Some(size) = size.as_u64() {
        return Ok(size);
    }
    let size = size
        .as_str()
        .ok_or_else(|| make_err!(Code::InvalidArgument, "'size' must be a number or string"))?;
    parse_data_size(size).map_err(|e| make_err!(Code::InvalidArgument, "{e}"))
}

/// Volume file inside a directory pool. Allocates eagerly when the backing
/// is created.
pub struct DirectoryVolumeBacking {
    inner: FileVolume,
}

impl DirectoryVolumeBacking {
    pub fn new(pool: Arc<dyn PoolConnection>, config: &BackingConfig, backing_id: Uuid) -> Self {
        Self {
            inner: FileVolume::new(pool, config, backing_id),
        }
    }
}

#[async_trait]
impl ResourceBacking for DirectoryVolumeBacking {
    fn backing_id(&self) -> Uuid {
        self.inner.backing_id
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Volume
    }

    fn pool_id(&self) -> &str {
        self.inner.pool.pool_id()
    }

    fn update_commands(&self) -> Vec<&'static str> {
        vec![
            commands::ALLOCATE,
            commands::RELEASE,
            commands::RESIZE,
            commands::INFO,
        ]
    }

    async fn create(&self) -> Result<(), Error> {
        self.inner.allocate().await.map(|_| ())
    }

    async fn destroy(&self) -> Result<(), Error> {
        self.inner.destroy().await
    }

    async fn update(&self, command: &str, args: Value) -> Result<Value, Error> {
        self.inner.update(command, args).await
    }

    async fn clone_resource(&self, args: Value) -> Result<Value, Error> {
        self.inner.clone_resource(args).await
    }
}

/// Volume file on a mounted NFS export. Same file behavior as a directory
/// volume, but physical allocation is deferred to an explicit `allocate`
/// command since the mount may appear after the backing is registered.
pub struct NfsVolumeBacking {
    inner: FileVolume,
}

impl NfsVolumeBacking {
    pub fn new(pool: Arc<dyn PoolConnection>, config: &BackingConfig, backing_id: Uuid) -> Self {
        Self {
            inner: FileVolume::new(pool, config, backing_id),
        }
    }
}

#[async_trait]
impl ResourceBacking for NfsVolumeBacking {
    fn backing_id(&self) -> Uuid {
        self.inner.backing_id
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Volume
    }

    fn pool_id(&self) -> &str {
        self.inner.pool.pool_id()
    }

    fn update_commands(&self) -> Vec<&'static str> {
        vec![
            commands::ALLOCATE,
            commands::RELEASE,
            commands::RESIZE,
            commands::INFO,
        ]
    }

    async fn create(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Error> {
        self.inner.destroy().await
    }

    async fn update(&self, command: &str, args: Value) -> Result<Value, Error> {
        self.inner.update(command, args).await
    }

    async fn clone_resource(&self, args: Value) -> Result<Value, Error> {
        self.inner.clone_resource(args).await
    }
}
