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

use crate::serde_utils::convert_string_with_shellexpand;

/// Loopback-only default. Binding all interfaces requires an explicit
/// opt-in from the process invoker.
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 8000;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Address the dispatch server binds to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the dispatch server binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path the agent writes its process id to after the server socket is
    /// bound. The containing directory must exist and be writable.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub pid_file: String,
}

fn default_host() -> String {
    DEFAULT_BIND_HOST.to_string()
}

const fn default_port() -> u16 {
    DEFAULT_BIND_PORT
}

/// Driver kind recorded on an instance at build time. Resolved once and
/// reused for all subsequent lifecycle and migration phase calls.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Qemu,
    Libvirt,
}

impl core::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Qemu => f.write_str("qemu"),
            Self::Libvirt => f.write_str("libvirt"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Hypervisor driver managing this instance.
    pub driver: DriverKind,

    /// Opaque configuration blob handed through to the driver.
    #[serde(default)]
    pub spec: serde_json::Value,
}
