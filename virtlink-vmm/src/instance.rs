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
use virtlink_config::agent::InstanceConfig;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Built,
    Running,
    Paused,
    Stopped,
}

impl core::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Built => f.write_str("built"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Phase reached by the in-flight migration of one instance. The
/// orchestrator is the sole holder of "what phase we should be in"; the
/// worker only tracks what it has executed so it can reject out-of-order
/// phase calls.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    None,
    Prepared,
    Performing,
    Finished,
}

impl core::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Prepared => f.write_str("prepared"),
            Self::Performing => f.write_str("performing"),
            Self::Finished => f.write_str("finished"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationRole {
    Source,
    Destination,
}

/// Migration bookkeeping carried by the instance itself; there is no
/// separately persisted session object.
#[derive(Debug, Clone)]
pub struct MigrationState {
    pub phase: MigrationPhase,
    pub role: MigrationRole,
    /// Inbound URI recorded on the destination side during prepare.
    pub inbound_uri: Option<String>,
    /// Target URI of the transfer, recorded on the source side so a
    /// resume can retry without the caller repeating it.
    pub transfer_uri: Option<String>,
    /// Lifecycle state to restore on cancel.
    pub pre_migration_state: InstanceState,
    /// Whether the last transfer leg completed; feeds the finish verdict.
    pub transfer_ok: bool,
}

/// One tracked virtual-machine registration on this worker node.
pub struct InstanceRecord {
    pub instance_id: String,
    pub config: InstanceConfig,
    pub state: InstanceState,
    pub migration: Option<MigrationState>,
}

impl InstanceRecord {
    pub const fn new(instance_id: String, config: InstanceConfig) -> Self {
        Self {
            instance_id,
            config,
            state: InstanceState::Built,
            migration: None,
        }
    }

    pub fn migration_phase(&self) -> MigrationPhase {
        self.migration
            .as_ref()
            .map_or(MigrationPhase::None, |m| m.phase)
    }
}

/// Parameters of a `stop_instance` call. The graceful-versus-forceful
/// choice and the timeout policy belong to the caller, not the transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StopParams {
    #[serde(default = "default_true")]
    pub graceful: bool,

    /// Graceful-path budget; expiry reports `DeadlineExceeded` and leaves
    /// the forceful retry to the caller.
    #[serde(default = "default_stop_timeout_secs")]
    pub timeout_secs: u64,

    /// Shutdown command to issue inside the guest, supplied by the
    /// orchestrator.
    #[serde(default)]
    pub shutdown_command: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for StopParams {
    fn default() -> Self {
        Self {
            graceful: true,
            timeout_secs: default_stop_timeout_secs(),
            shutdown_command: None,
            username: None,
            password: None,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_stop_timeout_secs() -> u64 {
    60
}
