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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use scopeguard::defer;
use tokio::net::TcpListener;
use tokio::sync::watch;
#[cfg(target_family = "unix")]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{event, Level};
use virtlink_config::agent::{DEFAULT_BIND_HOST, DEFAULT_BIND_PORT};
use virtlink_error::{Code, Error, ResultExt, make_err};
use virtlink_resource::ResourceManager;
use virtlink_rpc::{CapabilityRegistry, DispatchServer};
use virtlink_service::{AgentServer, ResourceServer, VmmServer};
use virtlink_vmm::manager::InstanceManager;
use virtlink_vmm::runner::ShellCommandRunner;

/// Worker-side virtualization agent.
#[derive(Parser, Debug)]
#[clap(author = "The Virtlink Authors", version, about, long_about = None)]
struct Args {
    /// Address the dispatch server binds to.
    #[clap(long, default_value = DEFAULT_BIND_HOST)]
    host: String,

    /// Port the dispatch server binds to.
    #[clap(long, default_value_t = DEFAULT_BIND_PORT)]
    port: u16,

    /// Bind to all interfaces instead of the configured host. Off by
    /// default so a bare invocation stays loopback-only.
    #[clap(long)]
    bind_all: bool,

    /// File the agent writes its process id to once the server socket is
    /// bound. The containing directory must exist and be writable.
    #[clap(long)]
    pid_file: PathBuf,
}

/// Initialize tracing.
fn init_tracing() -> Result<(), Error> {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .pretty()
        .with_timer(tracing_subscriber::fmt::time::time())
        .with_env_filter(env_filter)
        .init();
    Ok(())
}

/// The PID-file directory must be usable before we bind anything, so a
/// misconfiguration fails fast instead of after the socket is live.
fn check_pid_file_dir(pid_file: &Path) -> Result<(), Error> {
    let dir = pid_file.parent().filter(|p| !p.as_os_str().is_empty()).ok_or_else(|| {
        make_err!(
            Code::InvalidArgument,
            "PID file '{}' has no containing directory",
            pid_file.display()
        )
    })?;
    let metadata = std::fs::metadata(dir).err_tip_with_code(|_| {
        (
            Code::InvalidArgument,
            format!("PID file directory '{}' does not exist", dir.display()),
        )
    })?;
    if !metadata.is_dir() {
        return Err(make_err!(
            Code::InvalidArgument,
            "PID file parent '{}' is not a directory",
            dir.display()
        ));
    }
    if metadata.permissions().readonly() {
        return Err(make_err!(
            Code::PermissionDenied,
            "PID file directory '{}' is not writable",
            dir.display()
        ));
    }
    Ok(())
}

fn build_registry() -> Result<Arc<CapabilityRegistry>, Error> {
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register(
        "resource",
        Arc::new(ResourceServer::new(Arc::new(ResourceManager::new()))),
    )?;
    registry.register(
        "virt.vmm",
        Arc::new(VmmServer::new(Arc::new(InstanceManager::new(Arc::new(
            ShellCommandRunner,
        ))))),
    )?;
    registry.register(
        "agent",
        Arc::new(AgentServer::new(Arc::downgrade(&registry))),
    )?;
    Ok(registry)
}

async fn inner_main(args: Args, shutdown_rx: watch::Receiver<bool>) -> Result<(), Error> {
    let registry = build_registry()?;
    let host = if args.bind_all { "0.0.0.0" } else { args.host.as_str() };
    let bind_addr = format!("{host}:{}", args.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .err_tip(|| format!("Failed to bind dispatch server to {bind_addr}"))?;
    event!(Level::INFO, %bind_addr, "Dispatch server listening");

    // The PID file only appears once the socket is live, so process
    // supervisors polling it never race a half-started agent.
    std::fs::write(&args.pid_file, format!("{}\n", std::process::id()))
        .err_tip(|| format!("Failed to write PID file '{}'", args.pid_file.display()))?;
    defer! {
        if let Err(err) = std::fs::remove_file(&args.pid_file) {
            event!(Level::WARN, ?err, "Failed to remove PID file");
        }
    }

    let server = Arc::new(DispatchServer::new(registry));
    server.serve(listener, shutdown_rx).await
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    let args = Args::parse();
    check_pid_file_dir(&args.pid_file)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sigint_tx = shutdown_tx.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            event!(Level::WARN, "Process terminated via SIGINT");
            let _ = sigint_tx.send(true);
        }
    });

    #[cfg(target_family = "unix")]
    {
        let sigterm_tx = shutdown_tx;
        runtime.spawn(async move {
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                event!(Level::ERROR, "Failed to listen to SIGTERM");
                return;
            };
            sigterm.recv().await;
            event!(Level::WARN, "Process terminated via SIGTERM");
            let _ = sigterm_tx.send(true);
        });
    }

    runtime
        .block_on(inner_main(args, shutdown_rx))
        .err_tip(|| "main() function failed")?;
    event!(Level::INFO, "Agent shut down cleanly");
    Ok(())
}
