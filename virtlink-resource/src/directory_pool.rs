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

use async_trait::async_trait;
use serde_json::{Value, json};
use virtlink_config::resources::{DirectoryPoolSpec, PoolType};
use virtlink_error::{Error, ResultExt};

use crate::pool_connection::PoolConnection;

/// Pool backed by a plain directory tree. Opening creates the root
/// directory if absent; closing removes it only when it ended up empty, so
/// user data is never deleted.
pub struct DirectoryPoolConnection {
    pool_id: String,
    path: PathBuf,
}

impl DirectoryPoolConnection {
    pub fn new(pool_id: String, spec: &DirectoryPoolSpec) -> Self {
        Self {
            pool_id,
            path: PathBuf::from(&spec.path),
        }
    }
}

#[async_trait]
impl PoolConnection for DirectoryPoolConnection {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn pool_type(&self) -> PoolType {
        PoolType::Filesystem
    }

    fn root_path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn open(&self) -> Result<(), Error> {
        // create_dir_all is a no-op on an existing tree, which gives us the
        // required open idempotency for free.
        tokio::fs::create_dir_all(&self.path)
            .await
            .err_tip(|| format!("Failed to create pool root {}", self.path.display()))?;
        tracing::info!(pool_id = %self.pool_id, path = %self.path.display(), "Directory pool opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let mut entries = match tokio::fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            // Already gone means already closed.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(Error::from(err)
                    .append(format!("Failed to inspect pool root {}", self.path.display())));
            }
        };
        let is_empty = entries
            .next_entry()
            .await
            .err_tip(|| "Failed to enumerate pool root")?
            .is_none();
        if !is_empty {
            tracing::debug!(
                pool_id = %self.pool_id,
                "Pool root not empty on close, leaving directory in place"
            );
            return Ok(());
        }
        tokio::fs::remove_dir(&self.path)
            .await
            .err_tip(|| format!("Failed to remove pool root {}", self.path.display()))?;
        tracing::info!(pool_id = %self.pool_id, "Directory pool closed");
        Ok(())
    }

    async fn connected(&self) -> Result<bool, Error> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn info(&self) -> Result<Value, Error> {
        Ok(json!({
            "uuid": self.pool_id,
            "type": self.pool_type().to_string(),
            "path": self.path.display().to_string(),
            "connected": self.connected().await?,
        }))
    }
}
