// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::compat::CompatibilityMonitor;
use crate::config::WrapperPaths;
use crate::error::{DaemonError, Result};
use crate::platform::{Denylist, SocketPathProvider, labels};
use crate::slots::Slot;
use dexwrap_proto::{ACK, Request, Verdict, fdpass, read_request};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::{StreamExt, wrappers::UnixListenerStream};
use tracing::{debug, error, info, warn};

/// Files whose SELinux labels the server sets before listening.
#[derive(Clone, Debug)]
pub struct LabelTargets {
    pub wrappers: WrapperPaths,
    pub hook_libraries: Vec<PathBuf>,
}

pub struct RequestServer {
    socket_path: PathBuf,
    listener: UnixListener,
    monitor: Arc<CompatibilityMonitor>,
    denylist: Arc<dyn Denylist>,
}

impl RequestServer {
    /// Label the wrappers and hooks, then bind the socket under the matching creation context.
    ///
    /// Must run inside a Tokio runtime.
    pub fn bind(
        socket: &dyn SocketPathProvider,
        targets: &LabelTargets,
        monitor: Arc<CompatibilityMonitor>,
        denylist: Arc<dyn Denylist>,
    ) -> Result<Self> {
        let socket_path = socket.socket_path();
        debug!(operation = "server_new", socket_path = %socket_path.display(), "Initializing request server");
        let policy = monitor.policy().clone();

        let socket_context = if policy.check_access(
            labels::DEX2OAT,
            labels::DEX2OAT_EXEC,
            "file",
            "execute_no_trans",
        ) {
            policy.set_file_context(&targets.wrappers.wrapper32, labels::DEX2OAT_EXEC);
            policy.set_file_context(&targets.wrappers.wrapper64, labels::DEX2OAT_EXEC);
            labels::DEX2OAT
        } else {
            policy.set_file_context(&targets.wrappers.wrapper32, labels::MODULE_FILE);
            policy.set_file_context(&targets.wrappers.wrapper64, labels::MODULE_FILE);
            labels::INSTALLD
        };
        for hook in &targets.hook_libraries {
            policy.set_file_context(hook, labels::MODULE_FILE);
        }
        debug!(operation = "server_labels_set", socket_context, "Wrapper and hook labels applied");

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            debug!(operation = "server_remove_stale_socket", socket_path = %socket_path.display(), "Removing existing socket file");
            std::fs::remove_file(&socket_path)?;
        }

        // The creation context is per thread: set, bind and reset without yielding
        policy.set_sock_create_context(Some(socket_context));
        let bound = std::os::unix::net::UnixListener::bind(&socket_path);
        policy.set_sock_create_context(None);
        let listener = bound.map_err(|source| DaemonError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&socket_path)?.permissions();
            perms.set_mode(0o666);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        info!(operation = "start_server", socket_path = %socket_path.display(), "Dex2oat wrapper daemon listening");
        Ok(Self {
            socket_path,
            listener,
            monitor,
            denylist,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve connections one at a time until `accept` fails.
    ///
    /// An accept failure is fatal: the substitution is disabled and the
    /// compatibility state becomes `CRASHED`.
    pub async fn run(self) -> Result<()> {
        let Self {
            socket_path,
            listener,
            monitor,
            denylist,
        } = self;
        let mut incoming = UnixListenerStream::new(listener);

        let mut connection_count: u64 = 0;
        while let Some(stream) = incoming.next().await {
            match stream {
                Ok(socket) => {
                    connection_count += 1;
                    handle_client(&monitor, denylist.as_ref(), socket).await;
                }
                Err(e) => {
                    error!(operation = "accept_connection", socket_path = %socket_path.display(), error = %e, connection_count, "Dex2oat wrapper daemon crashed");
                    monitor.on_server_crashed();
                    return Err(DaemonError::Accept(e));
                }
            }
        }

        debug!(operation = "server_run_loop_exit", total_connections = connection_count, "Server run loop exited");
        Ok(())
    }
}

/// Remove the socket file left behind by a server.
pub fn remove_socket(socket_path: &Path) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
        debug!(operation = "shutdown_socket_removed", socket_path = %socket_path.display(), "Socket file removed");
    }
    Ok(())
}

/// Handle one request. The connection closes when `socket` drops, with or
/// without a response.
async fn handle_client(monitor: &CompatibilityMonitor, denylist: &dyn Denylist, mut socket: UnixStream) {
    let session_id = dexwrap_logging::correlation_id();

    let request = match read_request(&mut socket).await {
        Ok(request) => request,
        Err(e) => {
            warn!(operation = "handle_client", session_id = %session_id, error = %e, "Rejecting request; closing without response");
            return;
        }
    };

    match request {
        Request::ReleaseDescriptor { slot } => {
            let Some(slot) = Slot::from_index(slot) else {
                warn!(operation = "release_descriptor", session_id = %session_id, slot, "Unknown slot");
                return;
            };
            release_descriptor(monitor, &session_id, slot, &mut socket).await;
        }
        Request::ClassifyProcess { process_name } => {
            let denied = denylist.is_denied(&process_name);
            let verdict = Verdict::from_denied(denied);
            if let Err(e) = socket.write_all(&verdict.to_le_bytes()).await {
                warn!(operation = "classify_process", session_id = %session_id, process_name = %process_name, error = %e, "Failed to send verdict");
                return;
            }
            debug!(operation = "classify_process", session_id = %session_id, process_name = %process_name, denied, "Process {} for injected dex2oat", if denied { "denied" } else { "allowed" });
        }
    }
}

async fn release_descriptor(
    monitor: &CompatibilityMonitor,
    session_id: &str,
    slot: Slot,
    socket: &mut UnixStream,
) {
    let table = monitor.table();
    let fd = table.get(slot);
    let ack = ACK.to_le_bytes();

    // Descriptor and ack leave in one sendmsg
    let sent = socket
        .async_io(Interest::WRITABLE, || {
            fdpass::send_with_fd(socket.as_fd(), fd, &ack)
        })
        .await;

    let result = match sent {
        Ok(n) if n < ack.len() => socket.write_all(&ack[n..]).await,
        Ok(_) => Ok(()),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => match table.path(slot) {
            Some(path) => {
                debug!(operation = "release_descriptor", session_id = %session_id, %slot, path = %path.display(), "Sent descriptor");
            }
            None => {
                warn!(operation = "release_descriptor", session_id = %session_id, %slot, "Slot never opened; sent ack without descriptor");
            }
        },
        Err(e) => {
            warn!(operation = "release_descriptor", session_id = %session_id, %slot, error = %e, "Failed to send descriptor");
        }
    }
}
