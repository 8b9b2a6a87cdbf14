// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::compat::{CompatibilityMonitor, WatchDirective};
use crate::error::Result;
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Feeds close-after-write events on the SELinux control files into the
/// compatibility monitor.
pub struct MacStatusWatcher {
    monitor: Arc<CompatibilityMonitor>,
    paths: Vec<PathBuf>,
}

fn is_close_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

impl MacStatusWatcher {
    pub fn new(monitor: Arc<CompatibilityMonitor>, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            monitor,
            paths: paths.into_iter().collect(),
        }
    }

    /// Watch until the monitor reaches a terminal state.
    ///
    /// One synthetic event is processed before any real one so the current
    /// SELinux status is applied at startup. Fails without processing any
    /// event when the watcher cannot be created or no file can be watched.
    pub async fn run(self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) if is_close_write(&event.kind) => {
                    let _ = tx.send(event.paths);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(operation = "mac_watch", error = %e, "File watcher error");
                }
            })?;

        let mut watching = 0usize;
        let mut last_error = None;
        for path in &self.paths {
            match watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    watching += 1;
                    debug!(operation = "mac_watch", path = %path.display(), "Watching SELinux control file");
                }
                Err(e) => {
                    warn!(operation = "mac_watch", path = %path.display(), error = %e, "Failed to watch SELinux control file");
                    last_error = Some(e);
                }
            }
        }
        // Nothing to react to: the monitor would never see a status change
        if watching == 0 {
            return Err(match last_error {
                Some(e) => e.into(),
                None => notify::Error::generic("no SELinux control files to watch").into(),
            });
        }
        info!(operation = "mac_watch", files = watching, "SELinux observer started");

        if self.dispatch().await == WatchDirective::Continue {
            while let Some(paths) = rx.recv().await {
                debug!(operation = "mac_watch", paths = ?paths, "SELinux control file written");
                if self.dispatch().await == WatchDirective::Stop {
                    break;
                }
            }
        }

        drop(watcher);
        info!(operation = "mac_watch", state = %self.monitor.state(), "SELinux observer stopped");
        Ok(())
    }

    /// Transitions mount and read files, so they run off the async workers.
    async fn dispatch(&self) -> WatchDirective {
        let monitor = self.monitor.clone();
        match tokio::task::spawn_blocking(move || monitor.on_mac_status_changed()).await {
            Ok(directive) => directive,
            Err(e) => {
                error!(operation = "mac_watch", error = %e, "Status handler failed");
                WatchDirective::Stop
            }
        }
    }
}
