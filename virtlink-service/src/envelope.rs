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

use serde_json::{Value, json};
use virtlink_error::{Code, Error, ResultExt, make_input_err};

/// Wraps a lifecycle operation's outcome into the uniform
/// `{"status": 0, "out": ...}` / `{"status": 1, "error": ..., "code": ...}`
/// shape the orchestrator batches on. Expected, recoverable failures
/// become a status-1 payload; programming and infrastructure errors keep
/// propagating so they surface as transport faults.
pub fn envelope(result: Result<Value, Error>) -> Result<Value, Error> {
    match result {
        Ok(out) => Ok(json!({ "status": 0, "out": out })),
        Err(err) if is_expected(err.code) => {
            tracing::debug!(code = ?err.code, error = %err.message_string(), "Operation failed");
            Ok(json!({
                "status": 1,
                "code": err.code as i32,
                "error": err.message_string(),
            }))
        }
        Err(err) => Err(err),
    }
}

/// Failure categories the orchestrator handles per item instead of
/// treating the whole call as broken.
const fn is_expected(code: Code) -> bool {
    matches!(
        code,
        Code::InvalidArgument
            | Code::DeadlineExceeded
            | Code::NotFound
            | Code::AlreadyExists
            | Code::ResourceExhausted
            | Code::FailedPrecondition
            | Code::Unimplemented
            | Code::Unavailable
    )
}

/// Positional-parameter accessors shared by the capability sets. Missing
/// or mistyped parameters are caller bugs and decode to
/// `InvalidArgument`.
pub struct Params {
    operation: &'static str,
    values: Vec<Value>,
    next: usize,
}

impl Params {
    pub fn new(operation: &'static str, values: Vec<Value>) -> Self {
        Self {
            operation,
            values,
            next: 0,
        }
    }

    pub fn take_value(&mut self, name: &str) -> Result<Value, Error> {
        let index = self.next;
        self.next += 1;
        if index >= self.values.len() {
            return Err(make_input_err!(
                "Operation '{}' is missing parameter {index} ('{name}')",
                self.operation
            ));
        }
        Ok(self.values[index].take())
    }

    /// Optional trailing parameter; absent and `null` both decode to
    /// `None`.
    pub fn take_optional_value(&mut self) -> Option<Value> {
        let index = self.next;
        self.next += 1;
        match self.values.get_mut(index) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.take()),
        }
    }

    pub fn take_string(&mut self, name: &str) -> Result<String, Error> {
        let operation = self.operation;
        match self.take_value(name)? {
            Value::String(s) => Ok(s),
            other => Err(make_input_err!(
                "Operation '{operation}' expected a string for '{name}', got {other}"
            )),
        }
    }

    pub fn take_optional_string(&mut self, name: &str) -> Result<Option<String>, Error> {
        match self.take_optional_value() {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(make_input_err!(
                "Operation '{}' expected a string for '{name}', got {other}",
                self.operation
            )),
        }
    }

    pub fn take_decoded<T: serde::de::DeserializeOwned>(&mut self, name: &str) -> Result<T, Error> {
        let operation = self.operation;
        let value = self.take_value(name)?;
        serde_json::from_value(value)
            .err_tip(|| format!("While decoding '{name}' for operation '{operation}'"))
    }
}
