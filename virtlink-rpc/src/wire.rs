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
use serde_json::Value;
use virtlink_error::{Code, Error};

/// One call frame. `method` is a dotted path of the form
/// `capability.operation`; `params` is a positional value sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// One reply frame. Exactly one of `result`/`fault` is present.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl Reply {
    pub const fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            fault: None,
        }
    }

    pub fn fault(id: u64, error: Error) -> Self {
        Self {
            id,
            result: None,
            fault: Some(error.into()),
        }
    }

    /// Collapses the frame back into the call outcome. A frame carrying
    /// neither member is itself a protocol violation.
    pub fn into_result(self) -> Result<Value, Error> {
        if let Some(fault) = self.fault {
            return Err(fault.into());
        }
        self.result.ok_or_else(|| {
            Error::new(
                Code::Internal,
                format!("Reply {} carried neither result nor fault", self.id),
            )
        })
    }
}

/// Structured failure carried across the RPC boundary. The numeric `code`
/// identifies the error category; `messages` is the full context chain. A
/// client that does not recognize the code keeps the messages under
/// `Code::Unknown`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: i32,
    pub messages: Vec<String>,
}

impl From<Error> for Fault {
    fn from(error: Error) -> Self {
        Self {
            code: error.code as i32,
            messages: error.messages,
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Self {
            code: Code::from(fault.code),
            messages: fault.messages,
        }
    }
}
