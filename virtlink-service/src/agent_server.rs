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

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::{Value, json};
use virtlink_error::{Code, Error, make_err};
use virtlink_rpc::{CapabilityRegistry, CapabilitySet};

/// The `"agent"` capability set: liveness probing and method discovery.
/// Holds the registry weakly since the registry in turn owns this set.
pub struct AgentServer {
    registry: Weak<CapabilityRegistry>,
}

impl AgentServer {
    pub const fn new(registry: Weak<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    fn capabilities(&self) -> Result<Value, Error> {
        let registry = self.registry.upgrade().ok_or_else(|| {
            make_err!(Code::Internal, "Capability registry is already shut down")
        })?;
        Ok(json!({
            "capability_sets": registry.capability_names(),
            "methods": registry.method_directory(),
        }))
    }
}

#[async_trait]
impl CapabilitySet for AgentServer {
    fn operations(&self) -> Vec<&'static str> {
        vec!["ping", "capabilities"]
    }

    async fn invoke(&self, operation: &str, _params: Vec<Value>) -> Result<Value, Error> {
        match operation {
            "ping" => Ok(json!("pong")),
            "capabilities" => self.capabilities(),
            _ => Err(make_err!(
                Code::NotFound,
                "The agent capability set has no operation '{operation}'"
            )),
        }
    }
}
