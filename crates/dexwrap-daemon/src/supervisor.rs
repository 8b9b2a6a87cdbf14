// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Runs the request server and the SELinux watcher side by side
//!
//! * The server ending is final: its result is the daemon's result.
//! * The watcher finishing cleanly (a terminal state was reached) leaves the
//!   server running.
//! * The watcher failing is fatal: without it SELinux changes would go
//!   unnoticed, so the substitution is withdrawn and the daemon exits.
//! * `shutdown` completing withdraws the substitution and exits cleanly.

use crate::compat::CompatibilityMonitor;
use crate::error::{DaemonError, Result};
use crate::server::{self, RequestServer};
use crate::watcher::MacStatusWatcher;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

pub async fn run<S>(
    server: RequestServer,
    watcher: MacStatusWatcher,
    monitor: Arc<CompatibilityMonitor>,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    let socket_path = server.socket_path().to_path_buf();
    let mut server_task = tokio::spawn(server.run());
    let mut watcher_task = tokio::spawn(watcher.run());
    let mut watcher_running = true;
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            result = &mut server_task => {
                break match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!(operation = "serve", error = %e, state = %monitor.state(), "Request server failed");
                        Err(e)
                    }
                    Err(e) => {
                        error!(operation = "serve", error = %e, "Request server task failed");
                        monitor.on_server_crashed();
                        Err(DaemonError::Task { task: "server", source: e })
                    }
                };
            }
            result = &mut watcher_task, if watcher_running => {
                watcher_running = false;
                match result {
                    Ok(Ok(())) => {
                        info!(operation = "mac_watch", state = %monitor.state(), "SELinux observer finished; still serving requests");
                    }
                    Ok(Err(e)) => {
                        error!(operation = "mac_watch", error = %e, "SELinux observer failed; withdrawing wrapper substitution");
                        monitor.on_shutdown();
                        break Err(e);
                    }
                    Err(e) => {
                        error!(operation = "mac_watch", error = %e, "SELinux observer task failed; withdrawing wrapper substitution");
                        monitor.on_shutdown();
                        break Err(DaemonError::Task { task: "watcher", source: e });
                    }
                }
            }
            () = &mut shutdown => {
                monitor.on_shutdown();
                break Ok(());
            }
        }
    };

    server_task.abort();
    watcher_task.abort();
    if let Err(e) = server::remove_socket(&socket_path) {
        warn!(operation = "shutdown", socket_path = %socket_path.display(), error = %e, "Failed to remove socket");
    }

    info!(operation = "shutdown", state = %monitor.state(), "Dex2oat wrapper daemon stopped");
    outcome
}
