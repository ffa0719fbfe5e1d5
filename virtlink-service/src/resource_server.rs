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
use uuid::Uuid;
use virtlink_config::resources::{BackingConfig, PoolConfig};
use virtlink_error::{Code, Error, make_err, make_input_err};
use virtlink_resource::ResourceManager;
use virtlink_rpc::CapabilitySet;

use crate::envelope::{Params, envelope};

/// The `"resource"` capability set: pool-connection and backing lifecycle
/// operations, enveloped per item so the orchestrator can batch them.
pub struct ResourceServer {
    manager: Arc<ResourceManager>,
}

impl ResourceServer {
    pub const fn new(manager: Arc<ResourceManager>) -> Self {
        Self { manager }
    }

    async fn startup(&self) -> Result<Value, Error> {
        self.manager.startup().await?;
        Ok(Value::Null)
    }

    async fn teardown(&self) -> Result<Value, Error> {
        self.manager.teardown().await?;
        Ok(Value::Null)
    }

    async fn create_pool_connection(&self, mut params: Params) -> Result<Value, Error> {
        let config: PoolConfig = params.take_decoded("pool_config")?;
        self.manager.create_pool_connection(config).await
    }

    async fn destroy_pool_connection(&self, mut params: Params) -> Result<Value, Error> {
        let pool_id = params.take_string("pool_id")?;
        self.manager.destroy_pool_connection(&pool_id).await?;
        Ok(Value::Null)
    }

    async fn create_backing_object(&self, mut params: Params) -> Result<Value, Error> {
        let config: BackingConfig = params.take_decoded("backing_config")?;
        let backing_id = self.manager.create_backing_object(config).await?;
        Ok(json!(backing_id.to_string()))
    }

    async fn destroy_backing_object(&self, mut params: Params) -> Result<Value, Error> {
        let backing_id = take_backing_id(&mut params)?;
        self.manager.destroy_backing_object(&backing_id).await?;
        Ok(Value::Null)
    }

    async fn clone_resource_by_backing(&self, mut params: Params) -> Result<Value, Error> {
        let backing_id = take_backing_id(&mut params)?;
        let args = params.take_optional_value().unwrap_or(Value::Null);
        self.manager
            .clone_resource_by_backing(&backing_id, args)
            .await
    }

    async fn update_resource_by_backing(&self, mut params: Params) -> Result<Value, Error> {
        let backing_id = take_backing_id(&mut params)?;
        let command = params.take_string("command")?;
        let args = params.take_optional_value().unwrap_or(Value::Null);
        self.manager
            .update_resource_by_backing(&backing_id, &command, args)
            .await
    }

    async fn pool_info(&self, mut params: Params) -> Result<Value, Error> {
        let pool_id = params.take_string("pool_id")?;
        self.manager.pool_info(&pool_id).await
    }

    async fn list_pools(&self) -> Result<Value, Error> {
        self.manager.list_pools().await
    }
}

fn take_backing_id(params: &mut Params) -> Result<Uuid, Error> {
    let raw = params.take_string("backing_id")?;
    Uuid::parse_str(&raw).map_err(|e| make_input_err!("'{raw}' is not a valid backing id: {e}"))
}

#[async_trait]
impl CapabilitySet for ResourceServer {
    fn operations(&self) -> Vec<&'static str> {
        vec![
            "startup",
            "teardown",
            "create_pool_connection",
            "destroy_pool_connection",
            "create_backing_object",
            "destroy_backing_object",
            "clone_resource_by_backing",
            "update_resource_by_backing",
            "pool_info",
            "list_pools",
        ]
    }

    async fn invoke(&self, operation: &str, params: Vec<Value>) -> Result<Value, Error> {
        match operation {
            "startup" => envelope(self.startup().await),
            "teardown" => envelope(self.teardown().await),
            "create_pool_connection" => {
                envelope(self.create_pool_connection(Params::new("create_pool_connection", params)).await)
            }
            "destroy_pool_connection" => {
                envelope(self.destroy_pool_connection(Params::new("destroy_pool_connection", params)).await)
            }
            "create_backing_object" => {
                envelope(self.create_backing_object(Params::new("create_backing_object", params)).await)
            }
            "destroy_backing_object" => {
                envelope(self.destroy_backing_object(Params::new("destroy_backing_object", params)).await)
            }
            "clone_resource_by_backing" => envelope(
                self.clone_resource_by_backing(Params::new("clone_resource_by_backing", params))
                    .await,
            ),
            "update_resource_by_backing" => envelope(
                self.update_resource_by_backing(Params::new("update_resource_by_backing", params))
                    .await,
            ),
            "pool_info" => envelope(self.pool_info(Params::new("pool_info", params)).await),
            "list_pools" => envelope(self.list_pools().await),
            _ => Err(make_err!(
                Code::NotFound,
                "The resource capability set has no operation '{operation}'"
            )),
        }
    }
}
