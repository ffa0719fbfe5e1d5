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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use virtlink_config::agent::{DriverKind, InstanceConfig};
use virtlink_error::{Code, Error, ResultExt, make_err, make_input_err};

use crate::driver::{InstanceDriver, driver_factory};
use crate::instance::{
    InstanceRecord, InstanceState, MigrationPhase, MigrationRole, MigrationState, StopParams,
};
use crate::runner::CommandRunner;

/// Parameters of `prepare_migration`.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct PrepareParams {
    pub role: MigrationRole,
    pub transport: String,
    /// Listen host for the destination side. Unused on the source.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Tracks every virtual machine registered on this worker and drives each
/// one through its lifecycle and migration phases. All mutations happen
/// under one async mutex, held across driver calls, so concurrent RPCs
/// against the same instance serialize instead of interleaving.
pub struct InstanceManager {
    instances: Mutex<HashMap<String, InstanceRecord>>,
    drivers: HashMap<DriverKind, Arc<dyn InstanceDriver>>,
}

impl InstanceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        let mut drivers: HashMap<DriverKind, Arc<dyn InstanceDriver>> = HashMap::new();
        for kind in [DriverKind::Qemu, DriverKind::Libvirt] {
            drivers.insert(kind, driver_factory(kind, &runner));
        }
        Self {
            instances: Mutex::new(HashMap::new()),
            drivers,
        }
    }

    fn driver(&self, kind: DriverKind) -> Result<&Arc<dyn InstanceDriver>, Error> {
        self.drivers
            .get(&kind)
            .ok_or_else(|| make_err!(Code::Internal, "No driver registered for '{kind}'"))
    }

    /// Registers a new instance in the `Built` state. Nothing is launched
    /// yet. A failure leaves no record behind.
    pub async fn build_instance(
        &self,
        instance_id: &str,
        config: InstanceConfig,
    ) -> Result<(), Error> {
        self.driver(config.driver)?;
        let mut instances = self.instances.lock().await;
        if instances.contains_key(instance_id) {
            return Err(make_err!(
                Code::AlreadyExists,
                "Instance '{instance_id}' is already registered"
            ));
        }
        info!(%instance_id, driver = %config.driver, "Building instance");
        instances.insert(
            instance_id.to_string(),
            InstanceRecord::new(instance_id.to_string(), config),
        );
        Ok(())
    }

    /// Launches a built (or previously stopped) instance.
    pub async fn run_instance(&self, instance_id: &str) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        match record.state {
            InstanceState::Built | InstanceState::Stopped => {}
            state => {
                return Err(make_err!(
                    Code::FailedPrecondition,
                    "Instance '{instance_id}' cannot run from state '{state}'"
                ));
            }
        }
        let driver = self.driver(record.config.driver)?;
        driver
            .launch(instance_id, &record.config.spec)
            .await
            .err_tip(|| format!("While running instance '{instance_id}'"))?;
        record.state = InstanceState::Running;
        info!(%instance_id, "Instance running");
        Ok(())
    }

    pub async fn pause_instance(&self, instance_id: &str) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        if record.state != InstanceState::Running {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Instance '{instance_id}' is '{}', only running instances pause",
                record.state
            ));
        }
        let driver = self.driver(record.config.driver)?;
        driver
            .pause(instance_id, &record.config.spec)
            .await
            .err_tip(|| format!("While pausing instance '{instance_id}'"))?;
        record.state = InstanceState::Paused;
        Ok(())
    }

    pub async fn continue_instance(&self, instance_id: &str) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        if record.state != InstanceState::Paused {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Instance '{instance_id}' is '{}', only paused instances continue",
                record.state
            ));
        }
        let driver = self.driver(record.config.driver)?;
        driver
            .unpause(instance_id, &record.config.spec)
            .await
            .err_tip(|| format!("While continuing instance '{instance_id}'"))?;
        record.state = InstanceState::Running;
        Ok(())
    }

    /// Stops an instance, gracefully by default. When the graceful path
    /// does not finish inside `params.timeout_secs` the call reports
    /// `DeadlineExceeded` and the instance keeps its current state; the
    /// caller decides whether to retry forcefully.
    pub async fn stop_instance(&self, instance_id: &str, params: StopParams) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        match record.state {
            InstanceState::Running | InstanceState::Paused => {}
            state => {
                return Err(make_err!(
                    Code::FailedPrecondition,
                    "Instance '{instance_id}' cannot stop from state '{state}'"
                ));
            }
        }
        let driver = self.driver(record.config.driver)?;
        if params.graceful {
            let budget = Duration::from_secs(params.timeout_secs);
            match tokio::time::timeout(
                budget,
                driver.stop_graceful(instance_id, &record.config.spec, &params),
            )
            .await
            {
                Ok(result) => {
                    result.err_tip(|| format!("While stopping instance '{instance_id}'"))?;
                }
                Err(_) => {
                    return Err(make_err!(
                        Code::DeadlineExceeded,
                        "Graceful stop of '{instance_id}' did not finish within {}s",
                        params.timeout_secs
                    ));
                }
            }
        } else {
            driver
                .stop_force(instance_id, &record.config.spec)
                .await
                .err_tip(|| format!("While force-stopping instance '{instance_id}'"))?;
        }
        record.state = InstanceState::Stopped;
        info!(%instance_id, graceful = params.graceful, "Instance stopped");
        Ok(())
    }

    /// Releases driver resources and unregisters the instance. Refused
    /// while a migration is in flight; cancel or confirm it first.
    pub async fn cleanup_instance(&self, instance_id: &str) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        if record.migration_phase() != MigrationPhase::None {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Instance '{instance_id}' has a migration in phase '{}', cannot clean up",
                record.migration_phase()
            ));
        }
        let driver = self.driver(record.config.driver)?;
        driver
            .cleanup(instance_id, &record.config.spec)
            .await
            .err_tip(|| format!("While cleaning up instance '{instance_id}'"))?;
        instances.remove(instance_id);
        info!(%instance_id, "Instance cleaned up");
        Ok(())
    }

    pub async fn instance_status(&self, instance_id: &str) -> Result<Value, Error> {
        let instances = self.instances.lock().await;
        let record = instances.get(instance_id).ok_or_else(|| {
            make_err!(Code::NotFound, "Instance '{instance_id}' is not registered")
        })?;
        Ok(json!({
            "uuid": record.instance_id,
            "driver": record.config.driver.to_string(),
            "state": record.state.to_string(),
            "migration_phase": record.migration_phase().to_string(),
        }))
    }

    pub async fn list_instances(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        let mut ids: Vec<String> = instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Phase 1 of 5. Records migration intent on either side. On the
    /// destination this returns the inbound URI the source must transfer
    /// towards; the orchestrator carries it across.
    pub async fn prepare_migration(
        &self,
        instance_id: &str,
        params: PrepareParams,
    ) -> Result<Value, Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        if record.migration_phase() != MigrationPhase::None {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Instance '{instance_id}' already has a migration in phase '{}'",
                record.migration_phase()
            ));
        }
        let driver = self.driver(record.config.driver)?;
        driver.check_transport(&params.transport)?;
        let inbound_uri = match params.role {
            MigrationRole::Source => None,
            MigrationRole::Destination => {
                let host = params.host.as_deref().err_tip_with_code(|_| {
                    (Code::InvalidArgument, "Destination prepare requires 'host'")
                })?;
                let port = params.port.err_tip_with_code(|_| {
                    (Code::InvalidArgument, "Destination prepare requires 'port'")
                })?;
                Some(driver.inbound_uri(&params.transport, host, port)?)
            }
        };
        record.migration = Some(MigrationState {
            phase: MigrationPhase::Prepared,
            role: params.role,
            inbound_uri: inbound_uri.clone(),
            transfer_uri: None,
            pre_migration_state: record.state,
            transfer_ok: false,
        });
        info!(%instance_id, role = ?params.role, transport = %params.transport, "Migration prepared");
        Ok(json!({ "inbound_uri": inbound_uri }))
    }

    /// Phase 2 of 5. Source side only: runs the transfer towards the
    /// destination's inbound URI. A failed transfer leaves the migration
    /// in `Performing` so it can be resumed or cancelled.
    pub async fn perform_migration(&self, instance_id: &str, uri: &str) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        let migration = migration_in_phase(record, instance_id, MigrationPhase::Prepared)?;
        if migration.role != MigrationRole::Source {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Only the source side of '{instance_id}' performs the transfer"
            ));
        }
        migration.phase = MigrationPhase::Performing;
        migration.transfer_uri = Some(uri.to_string());
        let driver = self.driver(record.config.driver)?;
        let result = driver
            .transfer(instance_id, &record.config.spec, uri)
            .await
            .err_tip(|| format!("While migrating instance '{instance_id}' to {uri}"));
        // Re-borrow: the driver call needed `record` immutably.
        let Some(migration) = record.migration.as_mut() else {
            return Err(make_err!(
                Code::Internal,
                "Migration state of '{instance_id}' vanished mid-transfer"
            ));
        };
        migration.transfer_ok = result.is_ok();
        result?;
        info!(%instance_id, %uri, "Migration transfer complete");
        Ok(())
    }

    /// Retries the transfer of a migration already in `Performing`. The
    /// URI defaults to the one from the original perform call.
    pub async fn resume_migration(
        &self,
        instance_id: &str,
        uri: Option<&str>,
    ) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        let migration = migration_in_phase(record, instance_id, MigrationPhase::Performing)?;
        if migration.role != MigrationRole::Source {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Only the source side of '{instance_id}' resumes the transfer"
            ));
        }
        let uri = match uri {
            Some(uri) => {
                migration.transfer_uri = Some(uri.to_string());
                uri.to_string()
            }
            None => migration
                .transfer_uri
                .clone()
                .err_tip(|| format!("No transfer URI recorded for '{instance_id}' to resume"))?,
        };
        let driver = self.driver(record.config.driver)?;
        let result = driver
            .transfer(instance_id, &record.config.spec, &uri)
            .await
            .err_tip(|| format!("While resuming migration of '{instance_id}' to {uri}"));
        let Some(migration) = record.migration.as_mut() else {
            return Err(make_err!(
                Code::Internal,
                "Migration state of '{instance_id}' vanished mid-transfer"
            ));
        };
        migration.transfer_ok = result.is_ok();
        result?;
        info!(%instance_id, %uri, "Migration transfer resumed and complete");
        Ok(())
    }

    /// Phase 3 of 5. Closes the transfer stage and reports the verdict
    /// both sides use to decide between confirm and cancel. The source
    /// finishes out of `Performing`; the destination runs no transfer leg
    /// and finishes straight out of `Prepared`.
    pub async fn finish_migration(&self, instance_id: &str) -> Result<Value, Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        let expected = match record.migration.as_ref().map(|m| m.role) {
            Some(MigrationRole::Destination) => MigrationPhase::Prepared,
            _ => MigrationPhase::Performing,
        };
        let migration = migration_in_phase(record, instance_id, expected)?;
        migration.phase = MigrationPhase::Finished;
        let success = match migration.role {
            MigrationRole::Source => migration.transfer_ok,
            // The transfer verdict lives on the source; the destination
            // reports whether it is ready to take over.
            MigrationRole::Destination => true,
        };
        info!(%instance_id, success, "Migration finished");
        Ok(json!({ "success": success }))
    }

    /// Phase 4 of 5 (terminal). Commits the migration: the source ends up
    /// stopped, the destination running. Migration bookkeeping is cleared
    /// so a later migration starts from a clean slate.
    pub async fn confirm_migration(&self, instance_id: &str) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        let migration = migration_in_phase(record, instance_id, MigrationPhase::Finished)?;
        let role = migration.role;
        record.state = match role {
            MigrationRole::Source => InstanceState::Stopped,
            MigrationRole::Destination => InstanceState::Running,
        };
        record.migration = None;
        info!(%instance_id, ?role, "Migration confirmed");
        Ok(())
    }

    /// Phase 5 of 5 (terminal). Abandons a migration in `Prepared` or
    /// `Performing` and restores the pre-migration lifecycle state.
    pub async fn cancel_migration(&self, instance_id: &str) -> Result<(), Error> {
        let mut instances = self.instances.lock().await;
        let record = get_record_mut(&mut instances, instance_id)?;
        let Some(migration) = record.migration.as_ref() else {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Instance '{instance_id}' has no migration to cancel"
            ));
        };
        match migration.phase {
            MigrationPhase::Prepared | MigrationPhase::Performing => {}
            phase => {
                return Err(make_err!(
                    Code::FailedPrecondition,
                    "Migration of '{instance_id}' is in phase '{phase}', cannot cancel"
                ));
            }
        }
        record.state = migration.pre_migration_state;
        record.migration = None;
        warn!(%instance_id, "Migration cancelled");
        Ok(())
    }

    /// Force-stops and drops every registered instance. Used on agent
    /// shutdown; failures are logged, not propagated, so one stuck
    /// instance does not strand the rest.
    pub async fn teardown(&self) {
        let mut instances = self.instances.lock().await;
        for (instance_id, record) in instances.drain() {
            if !matches!(record.state, InstanceState::Running | InstanceState::Paused) {
                continue;
            }
            let Ok(driver) = self.driver(record.config.driver) else {
                continue;
            };
            if let Err(err) = driver.stop_force(&instance_id, &record.config.spec).await {
                warn!(%instance_id, ?err, "Failed to stop instance during teardown");
            }
        }
    }
}

fn get_record_mut<'a>(
    instances: &'a mut HashMap<String, InstanceRecord>,
    instance_id: &str,
) -> Result<&'a mut InstanceRecord, Error> {
    instances.get_mut(instance_id).ok_or_else(|| {
        make_err!(Code::NotFound, "Instance '{instance_id}' is not registered")
    })
}

/// Fetches the migration state, requiring it to be exactly in `expected`.
/// Out-of-order phase calls surface as `FailedPrecondition`, never as a
/// crash.
fn migration_in_phase<'a>(
    record: &'a mut InstanceRecord,
    instance_id: &str,
    expected: MigrationPhase,
) -> Result<&'a mut MigrationState, Error> {
    let phase = record.migration_phase();
    if phase != expected {
        return Err(make_err!(
            Code::FailedPrecondition,
            "Migration of '{instance_id}' is in phase '{phase}', expected '{expected}'"
        ));
    }
    record.migration.as_mut().ok_or_else(|| {
        make_input_err!("Instance '{instance_id}' has no migration state")
    })
}
