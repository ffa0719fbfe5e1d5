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

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use virtlink_config::resources::{DirectoryPoolSpec, NfsPoolSpec};
use virtlink_error::Error;
use virtlink_resource::directory_pool::DirectoryPoolConnection;
use virtlink_resource::nfs_pool::NfsPoolConnection;
use virtlink_resource::{Mounter, PoolConnection};

/// Records mount requests instead of touching the host.
#[derive(Default)]
struct FakeMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    mount_calls: AtomicUsize,
}

impl FakeMounter {
    fn force_unmount(&self, target: &Path) {
        self.mounted.lock().remove(target);
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        _source: &str,
        target: &Path,
        _fstype: &str,
        _options: &[String],
    ) -> Result<(), Error> {
        self.mount_calls.fetch_add(1, Ordering::Relaxed);
        self.mounted.lock().insert(target.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), Error> {
        self.mounted.lock().remove(target);
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, Error> {
        Ok(self.mounted.lock().contains(target))
    }
}

#[tokio::test]
async fn directory_pool_open_is_idempotent_test() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path().join("pool");
    let pool = DirectoryPoolConnection::new(
        "p1".to_string(),
        &DirectoryPoolSpec {
            path: root.display().to_string(),
        },
    );

    assert!(!pool.connected().await?);
    pool.open().await?;
    pool.open().await?;
    assert!(pool.connected().await?);
    assert!(root.is_dir());
    Ok(())
}

#[tokio::test]
async fn directory_pool_close_keeps_user_data_test() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path().join("pool");
    let pool = DirectoryPoolConnection::new(
        "p1".to_string(),
        &DirectoryPoolSpec {
            path: root.display().to_string(),
        },
    );
    pool.open().await?;
    tokio::fs::write(root.join("precious.img"), b"data").await?;

    pool.close().await?;
    assert!(root.join("precious.img").is_file(), "close must never delete user data");

    tokio::fs::remove_file(root.join("precious.img")).await?;
    pool.close().await?;
    assert!(!root.exists());

    // Closing an already-closed pool must not raise.
    pool.close().await?;
    Ok(())
}

#[tokio::test]
async fn nfs_pool_mounts_once_and_unmounts_test() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().unwrap();
    let mount_point = temp_dir.path().join("mnt");
    let mounter = Arc::new(FakeMounter::default());
    let pool = NfsPoolConnection::new(
        "p2".to_string(),
        NfsPoolSpec {
            server: "nfs.example.com".to_string(),
            export: "/exports/vms".to_string(),
            mount_point: mount_point.display().to_string(),
            options: vec!["soft".to_string()],
        },
        mounter.clone(),
    );

    pool.open().await?;
    pool.open().await?;
    assert_eq!(mounter.mount_calls.load(Ordering::Relaxed), 1);
    assert!(pool.connected().await?);

    pool.close().await?;
    assert!(!pool.connected().await?);
    pool.close().await?;
    Ok(())
}

#[tokio::test]
async fn nfs_pool_connected_reflects_external_teardown_test() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().unwrap();
    let mount_point = temp_dir.path().join("mnt");
    let mounter = Arc::new(FakeMounter::default());
    let pool = NfsPoolConnection::new(
        "p2".to_string(),
        NfsPoolSpec {
            server: "nfs.example.com".to_string(),
            export: "/exports/vms".to_string(),
            mount_point: mount_point.display().to_string(),
            options: vec![],
        },
        mounter.clone(),
    );
    pool.open().await?;
    assert!(pool.connected().await?);

    // Someone unmounts behind our back; connected must observe it.
    mounter.force_unmount(&mount_point);
    assert!(!pool.connected().await?);
    Ok(())
}

#[tokio::test]
async fn nfs_pool_info_snapshot_test() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().unwrap();
    let mount_point = temp_dir.path().join("mnt");
    let mounter = Arc::new(FakeMounter::default());
    let pool = NfsPoolConnection::new(
        "p2".to_string(),
        NfsPoolSpec {
            server: "nfs.example.com".to_string(),
            export: "/exports/vms".to_string(),
            mount_point: mount_point.display().to_string(),
            options: vec!["rw".to_string()],
        },
        mounter,
    );
    pool.open().await?;

    let info = pool.info().await?;
    assert_eq!(info["type"], serde_json::json!("nfs"));
    assert_eq!(info["source"], serde_json::json!("nfs.example.com:/exports/vms"));
    assert_eq!(info["connected"], serde_json::json!(true));
    Ok(())
}
