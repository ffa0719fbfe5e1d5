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

use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use virtlink_error::{Code, Error, ResultExt, make_err};

/// Narrow interface over the host's mount primitives. Pool variants depend
/// on this trait rather than shelling out themselves, so tests can observe
/// mount requests without touching the host.
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<(), Error>;

    async fn unmount(&self, target: &Path) -> Result<(), Error>;

    /// Queries live mount state. Must reflect external teardown, not a
    /// cached flag.
    async fn is_mounted(&self, target: &Path) -> Result<bool, Error>;
}

/// Mounter that drives the host's mount(8)/umount(8) and answers
/// `is_mounted` from the kernel mount table.
pub struct SystemMounter;

impl SystemMounter {
    fn check_output(output: &Output, command: &str) -> Result<(), Error> {
        if output.status.success() {
            return Ok(());
        }
        Err(make_err!(
            Code::Unavailable,
            "{command} failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<(), Error> {
        let mut command = tokio::process::Command::new("mount");
        command.arg("-t").arg(fstype);
        if !options.is_empty() {
            command.arg("-o").arg(options.join(","));
        }
        command.arg(source).arg(target);
        let output = command
            .output()
            .await
            .err_tip(|| format!("Failed to spawn mount for {source}"))?;
        Self::check_output(&output, "mount")
    }

    async fn unmount(&self, target: &Path) -> Result<(), Error> {
        let output = tokio::process::Command::new("umount")
            .arg(target)
            .output()
            .await
            .err_tip(|| format!("Failed to spawn umount for {}", target.display()))?;
        Self::check_output(&output, "umount")
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, Error> {
        let mounts = tokio::fs::read_to_string("/proc/self/mounts")
            .await
            .err_tip(|| "Failed to read kernel mount table")?;
        let target = target.to_string_lossy();
        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mount_point| mount_point == target))
    }
}
