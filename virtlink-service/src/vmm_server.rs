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
use serde_json::{Value, json};
use virtlink_config::agent::InstanceConfig;
use virtlink_error::{Code, Error, make_err};
use virtlink_rpc::CapabilitySet;
use virtlink_vmm::instance::StopParams;
use virtlink_vmm::manager::{InstanceManager, PrepareParams};

use crate::envelope::{Params, envelope};

/// The `"virt.vmm"` capability set: instance lifecycle plus the phased
/// migration protocol.
pub struct VmmServer {
    manager: Arc<InstanceManager>,
}

impl VmmServer {
    pub const fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }

    async fn build_instance(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        let config: InstanceConfig = params.take_decoded("instance_config")?;
        self.manager.build_instance(&instance_id, config).await?;
        Ok(Value::Null)
    }

    async fn run_instance(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        self.manager.run_instance(&instance_id).await?;
        Ok(Value::Null)
    }

    async fn pause_instance(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        self.manager.pause_instance(&instance_id).await?;
        Ok(Value::Null)
    }

    async fn continue_instance(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        self.manager.continue_instance(&instance_id).await?;
        Ok(Value::Null)
    }

    async fn stop_instance(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        let stop_params: StopParams = match params.take_optional_value() {
            Some(value) => serde_json::from_value(value)?,
            None => StopParams::default(),
        };
        self.manager.stop_instance(&instance_id, stop_params).await?;
        Ok(Value::Null)
    }

    async fn cleanup_instance(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        self.manager.cleanup_instance(&instance_id).await?;
        Ok(Value::Null)
    }

    async fn instance_status(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        self.manager.instance_status(&instance_id).await
    }

    async fn list_instances(&self) -> Result<Value, Error> {
        Ok(json!(self.manager.list_instances().await))
    }

    async fn migrate_prepare(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        let prepare: PrepareParams = params.take_decoded("migration_params")?;
        self.manager.prepare_migration(&instance_id, prepare).await
    }

    async fn migrate_perform(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        let uri = params.take_string("uri")?;
        self.manager.perform_migration(&instance_id, &uri).await?;
        Ok(Value::Null)
    }

    async fn migrate_resume(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        let uri = params.take_optional_string("uri")?;
        self.manager
            .resume_migration(&instance_id, uri.as_deref())
            .await?;
        Ok(Value::Null)
    }

    async fn migrate_finish(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        self.manager.finish_migration(&instance_id).await
    }

    async fn migrate_confirm(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        self.manager.confirm_migration(&instance_id).await?;
        Ok(Value::Null)
    }

    async fn migrate_cancel(&self, mut params: Params) -> Result<Value, Error> {
        let instance_id = params.take_string("instance_id")?;
        self.manager.cancel_migration(&instance_id).await?;
        Ok(Value::Null)
    }
}

#[async_trait]
impl CapabilitySet for VmmServer {
    fn operations(&self) -> Vec<&'static str> {
        vec![
            "build_instance",
            "run_instance",
            "pause_instance",
            "continue_instance",
            "stop_instance",
            "cleanup_instance",
            "instance_status",
            "list_instances",
            "migrate_instance_prepare",
            "migrate_instance_perform",
            "migrate_instance_resume",
            "migrate_instance_finish",
            "migrate_instance_confirm",
            "migrate_instance_cancel",
        ]
    }

    async fn invoke(&self, operation: &str, params: Vec<Value>) -> Result<Value, Error> {
        match operation {
            "build_instance" => {
                envelope(self.build_instance(Params::new("build_instance", params)).await)
            }
            "run_instance" => {
                envelope(self.run_instance(Params::new("run_instance", params)).await)
            }
            "pause_instance" => {
                envelope(self.pause_instance(Params::new("pause_instance", params)).await)
            }
            "continue_instance" => {
                envelope(self.continue_instance(Params::new("continue_instance", params)).await)
            }
            "stop_instance" => {
                envelope(self.stop_instance(Params::new("stop_instance", params)).await)
            }
            "cleanup_instance" => {
                envelope(self.cleanup_instance(Params::new("cleanup_instance", params)).await)
            }
            "instance_status" => {
                envelope(self.instance_status(Params::new("instance_status", params)).await)
            }
            "list_instances" => envelope(self.list_instances().await),
            "migrate_instance_prepare" => envelope(
                self.migrate_prepare(Params::new("migrate_instance_prepare", params))
                    .await,
            ),
            "migrate_instance_perform" => envelope(
                self.migrate_perform(Params::new("migrate_instance_perform", params))
                    .await,
            ),
            "migrate_instance_resume" => envelope(
                self.migrate_resume(Params::new("migrate_instance_resume", params))
                    .await,
            ),
            "migrate_instance_finish" => envelope(
                self.migrate_finish(Params::new("migrate_instance_finish", params))
                    .await,
            ),
            "migrate_instance_confirm" => envelope(
                self.migrate_confirm(Params::new("migrate_instance_confirm", params))
                    .await,
            ),
            "migrate_instance_cancel" => envelope(
                self.migrate_cancel(Params::new("migrate_instance_cancel", params))
                    .await,
            ),
            _ => Err(make_err!(
                Code::NotFound,
                "The virt.vmm capability set has no operation '{operation}'"
            )),
        }
    }
}
