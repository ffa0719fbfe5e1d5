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

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use virtlink_error::{Code, Error, ResultExt, make_err};

use crate::capability::CapabilityRegistry;
use crate::wire::{Reply, Request};

/// Network-facing request/response server. Each connection gets its own
/// task; within one connection requests are processed and answered in the
/// order received. A failed call faults exactly that request and leaves the
/// connection usable.
pub struct DispatchServer {
    registry: Arc<CapabilityRegistry>,
}

impl DispatchServer {
    pub const fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Accept loop. Returns when `shutdown_rx` flips to true; connection
    /// tasks already running wind down on their own when their peers hang
    /// up.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, peer_addr) = accept_result
                        .err_tip(|| "Failed to accept connection in DispatchServer::serve")?;
                    tracing::debug!(%peer_addr, "Client connected");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            tracing::debug!(%peer_addr, ?err, "Connection closed with error");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Dispatch server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), Error> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .err_tip(|| "Failed to read request frame")?
        {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.dispatch(request).await,
                // A frame we cannot even parse has no usable id; fault it
                // under id 0 and keep the connection alive.
                Err(err) => Reply::fault(
                    0,
                    make_err!(Code::InvalidArgument, "Malformed request frame: {err}"),
                ),
            };
            let mut encoded = serde_json::to_vec(&reply)
                .err_tip(|| "Failed to encode reply frame")?;
            encoded.push(b'\n');
            write_half
                .write_all(&encoded)
                .await
                .err_tip(|| "Failed to write reply frame")?;
        }
        Ok(())
    }

    /// Resolves the dotted method name and invokes the operation. All
    /// failures are logged with full context here, before they are turned
    /// into wire faults.
    async fn dispatch(&self, request: Request) -> Reply {
        let Request { id, method, params } = request;
        match self.invoke_method(&method, params).await {
            Ok(result) => Reply::success(id, result),
            Err(err) => {
                tracing::error!(%method, request_id = id, ?err, "RPC call failed");
                Reply::fault(id, err)
            }
        }
    }

    async fn invoke_method(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, Error> {
        // Capability-set names may themselves be dotted ("virt.vmm");
        // the operation is always the last segment.
        let (capability, operation) = method.rsplit_once('.').ok_or_else(|| {
            make_err!(
                Code::InvalidArgument,
                "Method '{method}' is not of the form 'capability.operation'"
            )
        })?;
        let set = self.registry.resolve(capability)?;
        set.invoke(operation, params)
            .await
            .err_tip(|| format!("While invoking '{method}'"))
    }
}
