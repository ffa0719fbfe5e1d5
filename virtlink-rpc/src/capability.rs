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

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use virtlink_error::{Code, Error, make_err};

/// A named group of invocable operations exposed to the dispatch layer.
#[async_trait]
pub trait CapabilitySet: Send + Sync {
    /// Operation names this set answers to, for directory listings.
    fn operations(&self) -> Vec<&'static str>;

    /// Invokes one operation with positional parameters. Implementations
    /// return `Code::NotFound` for operation names they do not carry.
    async fn invoke(&self, operation: &str, params: Vec<Value>) -> Result<Value, Error>;
}

/// Name to capability-set mapping. The registry only stores what it is
/// given; discovering sets is the caller's concern. Re-registering a name
/// is rejected so an orchestrator can never silently shadow a live
/// capability set.
pub struct CapabilityRegistry {
    sets: RwLock<HashMap<String, Arc<dyn CapabilitySet>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, set: Arc<dyn CapabilitySet>) -> Result<(), Error> {
        let mut sets = self.sets.write();
        if sets.contains_key(name) {
            return Err(make_err!(
                Code::AlreadyExists,
                "Capability set '{name}' is already registered"
            ));
        }
        sets.insert(name.to_string(), set);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn CapabilitySet>, Error> {
        self.sets.read().get(name).cloned().ok_or_else(|| {
            make_err!(Code::NotFound, "Capability set '{name}' is not registered")
        })
    }

    pub fn capability_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sets.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every registered operation as a dotted `capability.operation` name.
    pub fn method_directory(&self) -> Vec<String> {
        let sets = self.sets.read();
        let mut methods: Vec<String> = sets
            .iter()
            .flat_map(|(name, set)| {
                set.operations()
                    .into_iter()
                    .map(move |op| format!("{name}.{op}"))
            })
            .collect();
        methods.sort();
        methods
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
