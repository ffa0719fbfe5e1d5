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
use virtlink_config::agent::DriverKind;
use virtlink_error::{Code, Error, ResultExt, make_err};

use crate::instance::StopParams;
use crate::runner::CommandRunner;

/// Hypervisor-specific operations behind one interface value. Drivers do
/// not compose hypervisor command syntax; they run the opaque command
/// lines the orchestrator placed in the instance spec, through the narrow
/// `CommandRunner` seam.
#[async_trait]
pub trait InstanceDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Migration channel kinds this driver accepts. Fixed per driver.
    fn supported_transports(&self) -> &'static [&'static str];

    /// Composes the URI the destination side listens on for `transport`.
    fn inbound_uri(&self, transport: &str, host: &str, port: u16) -> Result<String, Error>;

    async fn launch(&self, instance_id: &str, spec: &Value) -> Result<(), Error>;

    async fn pause(&self, instance_id: &str, spec: &Value) -> Result<(), Error>;

    async fn unpause(&self, instance_id: &str, spec: &Value) -> Result<(), Error>;

    /// Issues the guest shutdown command. The caller wraps this in its own
    /// timeout budget.
    async fn stop_graceful(
        &self,
        instance_id: &str,
        spec: &Value,
        params: &StopParams,
    ) -> Result<(), Error>;

    async fn stop_force(&self, instance_id: &str, spec: &Value) -> Result<(), Error>;

    /// Releases instance-scoped resources (leases, sockets) before the
    /// record is unregistered.
    async fn cleanup(&self, instance_id: &str, spec: &Value) -> Result<(), Error>;

    /// Runs one transfer leg of a live migration towards `uri`.
    async fn transfer(&self, instance_id: &str, spec: &Value, uri: &str) -> Result<(), Error>;

    /// Validates that `transport` is one of the driver's supported channel
    /// kinds.
    fn check_transport(&self, transport: &str) -> Result<(), Error> {
        if self.supported_transports().contains(&transport) {
            return Ok(());
        }
        Err(make_err!(
            Code::InvalidArgument,
            "Transport '{transport}' is not supported by the {} driver (supported: {})",
            self.kind(),
            self.supported_transports().join(", ")
        ))
    }
}

/// Compile-time driver registry, one entry per `DriverKind`.
pub fn driver_factory(
    kind: DriverKind,
    runner: &Arc<dyn CommandRunner>,
) -> Arc<dyn InstanceDriver> {
    match kind {
        DriverKind::Qemu => Arc::new(QemuDriver {
            runner: runner.clone(),
        }),
        DriverKind::Libvirt => Arc::new(LibvirtDriver {
            runner: runner.clone(),
        }),
    }
}

/// Pulls a named command line out of the opaque instance spec. Absent
/// entries mean the orchestrator wants a state-only transition.
fn spec_command(spec: &Value, name: &str) -> Option<String> {
    spec.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn run_spec_command(
    runner: &Arc<dyn CommandRunner>,
    instance_id: &str,
    spec: &Value,
    name: &str,
) -> Result<(), Error> {
    let Some(command) = spec_command(spec, name) else {
        tracing::debug!(%instance_id, command = name, "No spec command, state-only transition");
        return Ok(());
    };
    runner
        .run(&command)
        .await
        .err_tip(|| format!("While running '{name}' for instance '{instance_id}'"))?;
    Ok(())
}

pub struct QemuDriver {
    runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl InstanceDriver for QemuDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Qemu
    }

    fn supported_transports(&self) -> &'static [&'static str] {
        &["tcp", "unix", "exec", "fd"]
    }

    fn inbound_uri(&self, transport: &str, host: &str, port: u16) -> Result<String, Error> {
        self.check_transport(transport)?;
        match transport {
            "tcp" => Ok(format!("tcp:{host}:{port}")),
            "unix" => Ok(format!("unix:{host}")),
            _ => Ok(format!("{transport}:{host}:{port}")),
        }
    }

    async fn launch(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        let command = spec_command(spec, "cmdline").ok_or_else(|| {
            make_err!(
                Code::InvalidArgument,
                "Instance '{instance_id}' spec has no 'cmdline' to launch"
            )
        })?;
        self.runner
            .run(&command)
            .await
            .err_tip(|| format!("While launching instance '{instance_id}'"))?;
        Ok(())
    }

    async fn pause(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        run_spec_command(&self.runner, instance_id, spec, "pause_command").await
    }

    async fn unpause(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        run_spec_command(&self.runner, instance_id, spec, "continue_command").await
    }

    async fn stop_graceful(
        &self,
        instance_id: &str,
        spec: &Value,
        params: &StopParams,
    ) -> Result<(), Error> {
        let command = params
            .shutdown_command
            .clone()
            .or_else(|| spec_command(spec, "shutdown_command"))
            .ok_or_else(|| {
                make_err!(
                    Code::InvalidArgument,
                    "No shutdown command available for graceful stop of '{instance_id}'"
                )
            })?;
        self.runner
            .run(&command)
            .await
            .err_tip(|| format!("While gracefully stopping instance '{instance_id}'"))?;
        Ok(())
    }

    async fn stop_force(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        run_spec_command(&self.runner, instance_id, spec, "kill_command").await
    }

    async fn cleanup(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        run_spec_command(&self.runner, instance_id, spec, "cleanup_command").await
    }

    async fn transfer(&self, instance_id: &str, spec: &Value, uri: &str) -> Result<(), Error> {
        let Some(template) = spec_command(spec, "migrate_command") else {
            tracing::debug!(%instance_id, %uri, "No migrate command, transfer is a state-only leg");
            return Ok(());
        };
        let command = template.replace("{uri}", uri);
        self.runner
            .run(&command)
            .await
            .err_tip(|| format!("While transferring instance '{instance_id}' to {uri}"))?;
        Ok(())
    }
}

pub struct LibvirtDriver {
    runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl InstanceDriver for LibvirtDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Libvirt
    }

    fn supported_transports(&self) -> &'static [&'static str] {
        &["tcp", "tls", "unix"]
    }

    fn inbound_uri(&self, transport: &str, host: &str, port: u16) -> Result<String, Error> {
        self.check_transport(transport)?;
        Ok(format!("{transport}://{host}:{port}/system"))
    }

    async fn launch(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        let command = spec_command(spec, "cmdline").ok_or_else(|| {
            make_err!(
                Code::InvalidArgument,
                "Instance '{instance_id}' spec has no 'cmdline' to launch"
            )
        })?;
        self.runner
            .run(&command)
            .await
            .err_tip(|| format!("While launching instance '{instance_id}'"))?;
        Ok(())
    }

    async fn pause(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        run_spec_command(&self.runner, instance_id, spec, "pause_command").await
    }

    async fn unpause(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        run_spec_command(&self.runner, instance_id, spec, "continue_command").await
    }

    async fn stop_graceful(
        &self,
        instance_id: &str,
        spec: &Value,
        params: &StopParams,
    ) -> Result<(), Error> {
        let command = params
            .shutdown_command
            .clone()
            .or_else(|| spec_command(spec, "shutdown_command"))
            .ok_or_else(|| {
                make_err!(
                    Code::InvalidArgument,
                    "No shutdown command available for graceful stop of '{instance_id}'"
                )
            })?;
        self.runner
            .run(&command)
            .await
            .err_tip(|| format!("While gracefully stopping instance '{instance_id}'"))?;
        Ok(())
    }

    async fn stop_force(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        run_spec_command(&self.runner, instance_id, spec, "kill_command").await
    }

    async fn cleanup(&self, instance_id: &str, spec: &Value) -> Result<(), Error> {
        run_spec_command(&self.runner, instance_id, spec, "cleanup_command").await
    }

    async fn transfer(&self, instance_id: &str, spec: &Value, uri: &str) -> Result<(), Error> {
        let Some(template) = spec_command(spec, "migrate_command") else {
            tracing::debug!(%instance_id, %uri, "No migrate command, transfer is a state-only leg");
            return Ok(());
        };
        let command = template.replace("{uri}", uri);
        self.runner
            .run(&command)
            .await
            .err_tip(|| format!("While transferring instance '{instance_id}' to {uri}"))?;
        Ok(())
    }
}
