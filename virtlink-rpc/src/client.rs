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

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use virtlink_error::{Code, Error, ResultExt, make_err};

use crate::wire::{Reply, Request};

/// Well-behaved client for the dispatch protocol. Faults come back as the
/// same `Error` the agent raised, because both sides share the closed
/// `Code` enumeration; an unrecognized numeric category degrades to
/// `Code::Unknown` with the message text preserved.
pub struct AgentClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write_half: OwnedWriteHalf,
    next_id: u64,
}

impl AgentClient {
    pub async fn connect(addr: &str) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)
            .await
            .err_tip(|| format!("Failed to connect to agent at {addr}"))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            write_half,
            next_id: 1,
        })
    }

    /// One round trip. Replies on a connection arrive in request order, so
    /// a single in-flight read suffices.
    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value, Error> {
        let id = self.next_id;
        self.next_id += 1;
        let request = Request {
            id,
            method: method.to_string(),
            params,
        };
        let mut encoded = serde_json::to_vec(&request)
            .err_tip(|| "Failed to encode request frame")?;
        encoded.push(b'\n');
        self.write_half
            .write_all(&encoded)
            .await
            .err_tip(|| format!("Failed to send request '{method}'"))?;

        let line = self
            .lines
            .next_line()
            .await
            .err_tip(|| format!("Failed to read reply for '{method}'"))?
            .ok_or_else(|| {
                make_err!(
                    Code::Unavailable,
                    "Agent closed the connection before replying to '{method}'"
                )
            })?;
        let reply: Reply = serde_json::from_str(&line)
            .err_tip_with_code(|_| (Code::Internal, "Malformed reply frame"))?;
        if reply.id != id {
            return Err(make_err!(
                Code::Internal,
                "Reply id {} does not match request id {id}",
                reply.id
            ));
        }
        reply.into_result()
    }
}
