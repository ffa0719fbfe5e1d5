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

use serde::{Deserialize, Serialize};

use crate::serde_utils::convert_data_size_with_shellexpand;

/// Id of a storage pool. This type will be used when referencing a pool in a
/// `BackingConfig::meta`'s `pool` field.
pub type PoolId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// A plain directory tree on a local filesystem.
    Filesystem,

    /// An NFS export mounted on the worker node.
    Nfs,
}

impl core::fmt::Display for PoolType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Filesystem => f.write_str("filesystem"),
            Self::Nfs => f.write_str("nfs"),
        }
    }
}

/// Every resource/backing record the orchestrator sends has a `meta` section
/// identifying the object and a `spec` section holding backend-specific
/// fields. New backend types must preserve this shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub meta: PoolMeta,
    pub spec: PoolSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PoolMeta {
    /// Pool id assigned by the orchestrator.
    pub uuid: PoolId,
}

/// Backend-specific pool parameters. The variant is inferred from the field
/// shape: an NFS spec carries `server`/`export`, a directory spec only a
/// `path`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PoolSpec {
    Nfs(NfsPoolSpec),
    Directory(DirectoryPoolSpec),
}

impl PoolSpec {
    pub const fn pool_type(&self) -> PoolType {
        match self {
            Self::Nfs(_) => PoolType::Nfs,
            Self::Directory(_) => PoolType::Filesystem,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DirectoryPoolSpec {
    /// Root directory backing the pool. Created on connection open if
    /// absent.
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NfsPoolSpec {
    /// NFS server host.
    pub server: String,

    /// Exported path on the server.
    pub export: String,

    /// Local mount point for the export.
    pub mount_point: String,

    /// Extra mount options joined with commas into the `-o` argument.
    #[serde(default)]
    pub options: Vec<String>,
}

impl NfsPoolSpec {
    /// The `server:/export` source half of the mount specification.
    pub fn mount_source(&self) -> String {
        format!("{}:{}", self.server, self.export)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Volume,
}

impl core::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Volume => f.write_str("volume"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackingConfig {
    pub meta: BackingMeta,
    pub spec: VolumeSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackingMeta {
    /// Upstream resource id, correlating to the orchestrator's resource
    /// object. Distinct from the worker-generated backing id.
    pub uuid: String,

    /// Pool the resource is carved from. The pool connection must already be
    /// open on this worker.
    pub pool: PoolId,

    /// Whether the orchestrator believes the resource is already physically
    /// allocated.
    #[serde(default)]
    pub allocated: bool,

    #[serde(default, rename = "type")]
    pub resource_type: ResourceType,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumeSpec {
    /// File name of the volume inside the pool root.
    pub filename: String,

    /// Requested size. Accepts a byte count or a suffixed string ("10M").
    #[serde(deserialize_with = "convert_data_size_with_shellexpand")]
    pub size: u64,
}
