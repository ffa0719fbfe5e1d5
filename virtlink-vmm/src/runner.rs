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

use async_trait::async_trait;
use virtlink_error::{Code, Error, ResultExt, make_err};

/// Narrow "run this external command and give me stdout" interface the
/// drivers depend on. Hypervisor command syntax itself is supplied by the
/// orchestrator inside instance specs; the agent never composes it.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command_line: &str) -> Result<String, Error>;
}

/// Runner that executes the command line on the host.
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command_line: &str) -> Result<String, Error> {
        let argv = shlex::split(command_line).ok_or_else(|| {
            make_err!(Code::InvalidArgument, "Unparsable command line: {command_line}")
        })?;
        let (program, args) = argv.split_first().ok_or_else(|| {
            make_err!(Code::InvalidArgument, "Empty command line")
        })?;
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .err_tip(|| format!("Failed to spawn '{command_line}'"))?;
        if !output.status.success() {
            // Backend failures always carry the triggering command for
            // diagnosis.
            return Err(make_err!(
                Code::Unavailable,
                "Command '{command_line}' failed with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
