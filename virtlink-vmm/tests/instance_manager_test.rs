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
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use virtlink_config::agent::{DriverKind, InstanceConfig};
use virtlink_error::{Code, Error, make_err};
use virtlink_vmm::instance::{InstanceState, MigrationPhase, MigrationRole, StopParams};
use virtlink_vmm::manager::{InstanceManager, PrepareParams};
use virtlink_vmm::runner::CommandRunner;

/// Records every command line instead of running it. Commands containing
/// the configured failure marker return `Unavailable`; an optional delay
/// simulates a guest that ignores its shutdown request.
struct FakeRunner {
    commands: Mutex<Vec<String>>,
    fail_marker: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            fail_marker: Mutex::new(None),
            delay: Mutex::new(None),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn fail_commands_containing(&self, marker: &str) {
        *self.fail_marker.lock() = Some(marker.to_string());
    }

    fn clear_failures(&self) {
        *self.fail_marker.lock() = None;
    }

    fn delay_commands(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command_line: &str) -> Result<String, Error> {
        self.commands.lock().push(command_line.to_string());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fail_marker = self.fail_marker.lock().clone();
        if let Some(marker) = fail_marker {
            if command_line.contains(&marker) {
                return Err(make_err!(
                    Code::Unavailable,
                    "Command '{command_line}' failed with status 1: injected"
                ));
            }
        }
        Ok(String::new())
    }
}

fn qemu_config() -> InstanceConfig {
    InstanceConfig {
        driver: DriverKind::Qemu,
        spec: json!({
            "cmdline": "qemu-system-x86_64 -name vm1 -m 512",
            "pause_command": "virsh suspend vm1",
            "continue_command": "virsh resume vm1",
            "shutdown_command": "virsh shutdown vm1",
            "kill_command": "virsh destroy vm1",
            "cleanup_command": "rm -f /run/vm1.sock",
            "migrate_command": "virsh migrate vm1 {uri}",
        }),
    }
}

fn prepare_source() -> PrepareParams {
    PrepareParams {
        role: MigrationRole::Source,
        transport: "tcp".to_string(),
        host: None,
        port: None,
    }
}

fn prepare_destination() -> PrepareParams {
    PrepareParams {
        role: MigrationRole::Destination,
        transport: "tcp".to_string(),
        host: Some("10.0.0.2".to_string()),
        port: Some(49152),
    }
}

#[tokio::test]
async fn build_twice_rejected_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager.build_instance("vm1", qemu_config()).await?;
    let err = manager
        .build_instance("vm1", qemu_config())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::AlreadyExists);
    Ok(())
}

#[tokio::test]
async fn unknown_instance_is_not_found_test() {
    let manager = InstanceManager::new(FakeRunner::new());
    let err = manager.run_instance("missing").await.unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    let err = manager.pause_instance("missing").await.unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    let err = manager
        .stop_instance("missing", StopParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    let err = manager.cleanup_instance("missing").await.unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    let err = manager.instance_status("missing").await.unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn lifecycle_walk_test() -> Result<(), Error> {
    let runner = FakeRunner::new();
    let manager = InstanceManager::new(runner.clone());
    manager.build_instance("vm1", qemu_config()).await?;

    let status = manager.instance_status("vm1").await?;
    assert_eq!(status["state"], "built");

    manager.run_instance("vm1").await?;
    assert_eq!(manager.instance_status("vm1").await?["state"], "running");

    manager.pause_instance("vm1").await?;
    assert_eq!(manager.instance_status("vm1").await?["state"], "paused");

    manager.continue_instance("vm1").await?;
    assert_eq!(manager.instance_status("vm1").await?["state"], "running");

    manager
        .stop_instance("vm1", StopParams::default())
        .await?;
    assert_eq!(manager.instance_status("vm1").await?["state"], "stopped");

    manager.cleanup_instance("vm1").await?;
    let err = manager.instance_status("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::NotFound);

    assert_eq!(
        runner.commands(),
        vec![
            "qemu-system-x86_64 -name vm1 -m 512",
            "virsh suspend vm1",
            "virsh resume vm1",
            "virsh shutdown vm1",
            "rm -f /run/vm1.sock",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn state_preconditions_enforced_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager.build_instance("vm1", qemu_config()).await?;

    // Built instances cannot pause, continue or stop.
    let err = manager.pause_instance("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    let err = manager.continue_instance("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    let err = manager
        .stop_instance("vm1", StopParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    // Running instances cannot run again.
    manager.run_instance("vm1").await?;
    let err = manager.run_instance("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    Ok(())
}

#[tokio::test]
async fn failed_launch_keeps_built_state_test() -> Result<(), Error> {
    let runner = FakeRunner::new();
    let manager = InstanceManager::new(runner.clone());
    manager.build_instance("vm1", qemu_config()).await?;

    runner.fail_commands_containing("qemu-system");
    let err = manager.run_instance("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
    assert_eq!(manager.instance_status("vm1").await?["state"], "built");

    // The failure message identifies the triggering command.
    assert!(
        err.messages[0].contains("qemu-system-x86_64"),
        "message should carry the command: {err:?}"
    );

    runner.clear_failures();
    manager.run_instance("vm1").await?;
    assert_eq!(manager.instance_status("vm1").await?["state"], "running");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_timeout_test() -> Result<(), Error> {
    let runner = FakeRunner::new();
    let manager = InstanceManager::new(runner.clone());
    manager.build_instance("vm1", qemu_config()).await?;
    manager.run_instance("vm1").await?;

    runner.delay_commands(Duration::from_secs(120));
    let err = manager
        .stop_instance(
            "vm1",
            StopParams {
                timeout_secs: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::DeadlineExceeded);
    // Still running: the caller chooses whether to escalate to force.
    assert_eq!(manager.instance_status("vm1").await?["state"], "running");

    manager
        .stop_instance(
            "vm1",
            StopParams {
                graceful: false,
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(manager.instance_status("vm1").await?["state"], "stopped");
    assert_eq!(
        runner.commands().last().map(String::as_str),
        Some("virsh destroy vm1")
    );
    Ok(())
}

#[tokio::test]
async fn phase_calls_without_prepare_are_rejected_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager.build_instance("vm1", qemu_config()).await?;
    manager.run_instance("vm1").await?;

    let err = manager
        .perform_migration("vm1", "tcp:10.0.0.2:49152")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    let err = manager.finish_migration("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    let err = manager.confirm_migration("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    let err = manager.cancel_migration("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    Ok(())
}

#[tokio::test]
async fn source_migration_phase_walk_test() -> Result<(), Error> {
    let runner = FakeRunner::new();
    let manager = InstanceManager::new(runner.clone());
    manager.build_instance("vm1", qemu_config()).await?;
    manager.run_instance("vm1").await?;

    let reply = manager.prepare_migration("vm1", prepare_source()).await?;
    assert_eq!(reply["inbound_uri"], serde_json::Value::Null);
    assert_eq!(
        manager.instance_status("vm1").await?["migration_phase"],
        "prepared"
    );

    // Preparing twice is an ordering violation, and the source cannot
    // finish before its transfer ran.
    let err = manager
        .prepare_migration("vm1", prepare_source())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    let err = manager.finish_migration("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    manager
        .perform_migration("vm1", "tcp:10.0.0.2:49152")
        .await?;
    assert_eq!(
        runner.commands().last().map(String::as_str),
        Some("virsh migrate vm1 tcp:10.0.0.2:49152")
    );

    let verdict = manager.finish_migration("vm1").await?;
    assert_eq!(verdict["success"], true);

    manager.confirm_migration("vm1").await?;
    let status = manager.instance_status("vm1").await?;
    assert_eq!(status["state"], "stopped");
    assert_eq!(status["migration_phase"], "none");
    Ok(())
}

#[tokio::test]
async fn destination_prepare_returns_inbound_uri_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager.build_instance("vm1", qemu_config()).await?;

    let reply = manager
        .prepare_migration("vm1", prepare_destination())
        .await?;
    assert_eq!(reply["inbound_uri"], "tcp:10.0.0.2:49152");

    // The destination side never runs a transfer leg.
    let err = manager
        .perform_migration("vm1", "tcp:10.0.0.2:49152")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    manager.cancel_migration("vm1").await?;
    Ok(())
}

#[tokio::test]
async fn confirmed_destination_is_running_test() -> Result<(), Error> {
    let runner = FakeRunner::new();
    let manager = InstanceManager::new(runner.clone());
    manager.build_instance("vm1", qemu_config()).await?;
    manager.prepare_migration("vm1", prepare_destination()).await?;

    // The destination runs no transfer leg; it finishes straight out of
    // prepared and confirm marks it live.
    let verdict = manager.finish_migration("vm1").await?;
    assert_eq!(verdict["success"], true);
    assert_eq!(
        manager.instance_status("vm1").await?["migration_phase"],
        "finished"
    );

    manager.confirm_migration("vm1").await?;
    let status = manager.instance_status("vm1").await?;
    assert_eq!(status["state"], "running");
    assert_eq!(status["migration_phase"], "none");
    assert_eq!(runner.commands(), Vec::<String>::new());
    Ok(())
}

#[tokio::test]
async fn destination_prepare_requires_listen_address_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager.build_instance("vm1", qemu_config()).await?;

    let err = manager
        .prepare_migration(
            "vm1",
            PrepareParams {
                role: MigrationRole::Destination,
                transport: "tcp".to_string(),
                host: None,
                port: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    // The rejected prepare leaves no migration state behind.
    assert_eq!(
        manager.instance_status("vm1").await?["migration_phase"],
        "none"
    );
    Ok(())
}

#[tokio::test]
async fn unsupported_transport_rejected_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager.build_instance("vm1", qemu_config()).await?;

    let err = manager
        .prepare_migration(
            "vm1",
            PrepareParams {
                role: MigrationRole::Source,
                transport: "rdma".to_string(),
                host: None,
                port: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    // A rejected prepare leaves no migration state behind.
    assert_eq!(
        manager.instance_status("vm1").await?["migration_phase"],
        "none"
    );
    Ok(())
}

#[tokio::test]
async fn failed_transfer_resumes_test() -> Result<(), Error> {
    let runner = FakeRunner::new();
    let manager = InstanceManager::new(runner.clone());
    manager.build_instance("vm1", qemu_config()).await?;
    manager.run_instance("vm1").await?;
    manager.prepare_migration("vm1", prepare_source()).await?;

    runner.fail_commands_containing("migrate");
    let err = manager
        .perform_migration("vm1", "tcp:10.0.0.2:49152")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
    // The migration stays in performing so it can be retried.
    assert_eq!(
        manager.instance_status("vm1").await?["migration_phase"],
        "performing"
    );

    // Resume reuses the URI from the original perform call.
    runner.clear_failures();
    manager.resume_migration("vm1", None).await?;
    assert_eq!(
        runner.commands().last().map(String::as_str),
        Some("virsh migrate vm1 tcp:10.0.0.2:49152")
    );

    let verdict = manager.finish_migration("vm1").await?;
    assert_eq!(verdict["success"], true);
    manager.confirm_migration("vm1").await?;
    Ok(())
}

#[tokio::test]
async fn finish_after_failed_transfer_reports_failure_test() -> Result<(), Error> {
    let runner = FakeRunner::new();
    let manager = InstanceManager::new(runner.clone());
    manager.build_instance("vm1", qemu_config()).await?;
    manager.run_instance("vm1").await?;
    manager.prepare_migration("vm1", prepare_source()).await?;

    runner.fail_commands_containing("migrate");
    let _ = manager
        .perform_migration("vm1", "tcp:10.0.0.2:49152")
        .await
        .unwrap_err();

    let verdict = manager.finish_migration("vm1").await?;
    assert_eq!(verdict["success"], false);
    Ok(())
}

#[tokio::test]
async fn cancel_restores_pre_migration_state_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager.build_instance("vm1", qemu_config()).await?;
    manager.run_instance("vm1").await?;
    manager.prepare_migration("vm1", prepare_source()).await?;

    manager.cancel_migration("vm1").await?;
    let status = manager.instance_status("vm1").await?;
    assert_eq!(status["state"], "running");
    assert_eq!(status["migration_phase"], "none");

    // Cancel after finish is too late.
    manager.prepare_migration("vm1", prepare_source()).await?;
    manager
        .perform_migration("vm1", "tcp:10.0.0.2:49152")
        .await?;
    manager.finish_migration("vm1").await?;
    let err = manager.cancel_migration("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    Ok(())
}

#[tokio::test]
async fn cleanup_rejected_mid_migration_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager.build_instance("vm1", qemu_config()).await?;
    manager.run_instance("vm1").await?;
    manager.prepare_migration("vm1", prepare_source()).await?;

    let err = manager.cleanup_instance("vm1").await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    manager.cancel_migration("vm1").await?;
    manager
        .stop_instance(
            "vm1",
            StopParams {
                graceful: false,
                ..Default::default()
            },
        )
        .await?;
    manager.cleanup_instance("vm1").await?;
    assert_eq!(manager.list_instances().await, Vec::<String>::new());
    Ok(())
}

#[tokio::test]
async fn libvirt_inbound_uri_scheme_test() -> Result<(), Error> {
    let manager = InstanceManager::new(FakeRunner::new());
    manager
        .build_instance(
            "vm2",
            InstanceConfig {
                driver: DriverKind::Libvirt,
                spec: json!({ "cmdline": "virsh create /etc/vm2.xml" }),
            },
        )
        .await?;

    let reply = manager
        .prepare_migration(
            "vm2",
            PrepareParams {
                role: MigrationRole::Destination,
                transport: "tls".to_string(),
                host: Some("10.0.0.3".to_string()),
                port: Some(16514),
            },
        )
        .await?;
    assert_eq!(reply["inbound_uri"], "tls://10.0.0.3:16514/system");

    // qemu transports do not leak into the libvirt driver.
    manager.cancel_migration("vm2").await?;
    let err = manager
        .prepare_migration(
            "vm2",
            PrepareParams {
                role: MigrationRole::Source,
                transport: "exec".to_string(),
                host: None,
                port: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn state_only_transitions_without_spec_commands_test() -> Result<(), Error> {
    let runner = FakeRunner::new();
    let manager = InstanceManager::new(runner.clone());
    manager
        .build_instance(
            "vm3",
            InstanceConfig {
                driver: DriverKind::Qemu,
                spec: json!({ "cmdline": "qemu-system-x86_64 -name vm3" }),
            },
        )
        .await?;
    manager.run_instance("vm3").await?;

    // Pause and force-stop have no configured commands; the record still
    // transitions.
    manager.pause_instance("vm3").await?;
    assert_eq!(manager.instance_status("vm3").await?["state"], "paused");
    manager
        .stop_instance(
            "vm3",
            StopParams {
                graceful: false,
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(manager.instance_status("vm3").await?["state"], "stopped");
    assert_eq!(runner.commands(), vec!["qemu-system-x86_64 -name vm3"]);
    Ok(())
}
