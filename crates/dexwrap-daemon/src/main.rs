// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use clap::Parser;
use dexwrap_daemon::compat::CompatibilityMonitor;
use dexwrap_daemon::config::{ArtLayout, DaemonConfig};
use dexwrap_daemon::denylist::FileDenylist;
use dexwrap_daemon::platform::linux::{BindMountController, SelinuxFs};
use dexwrap_daemon::server::{LabelTargets, RequestServer};
use dexwrap_daemon::supervisor;
use dexwrap_daemon::slots::DescriptorTable;
use dexwrap_daemon::status::StatusReporter;
use dexwrap_daemon::verify::MountVerifier;
use dexwrap_daemon::{CompatibilityState, MacStatusWatcher};
use dexwrap_logging::CliLoggingArgs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

const COMPONENT: &str = "dexwrap-daemon";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the Unix socket for listening
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Module directory holding bin/ with the wrappers and hooks
    #[arg(long)]
    module_dir: Option<PathBuf>,

    /// Process denylist file
    #[arg(long)]
    denylist: Option<PathBuf>,

    /// Where to publish the compatibility status as JSON
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// ART APEX layout providing the compiler binaries
    #[arg(long, value_enum)]
    art_layout: Option<ArtLayout>,

    /// Prefix giving the init mount namespace's view of a path
    #[arg(long)]
    container_root: Option<PathBuf>,

    /// selinuxfs mount point
    #[arg(long)]
    selinuxfs: Option<PathBuf>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    fn resolve_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(socket_path) = &self.socket_path {
            config.socket_path = socket_path.clone();
        }
        if let Some(module_dir) = &self.module_dir {
            config.module_dir = module_dir.clone();
        }
        if let Some(denylist) = &self.denylist {
            config.denylist_path = denylist.clone();
        }
        if let Some(status_file) = &self.status_file {
            config.status_path = Some(status_file.clone());
        }
        if let Some(art_layout) = self.art_layout {
            config.art_layout = art_layout;
        }
        if let Some(container_root) = &self.container_root {
            config.container_root = container_root.clone();
        }
        if let Some(selinuxfs) = &self.selinuxfs {
            config.selinuxfs = selinuxfs.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.resolve_config()?;
    args.logging.init(COMPONENT)?;

    // Create a span that sets the component field for all log messages in this daemon
    let span = tracing::info_span!("daemon", component = COMPONENT);
    let _enter = span.enter();

    info!(operation = "start_daemon", art_layout = ?config.art_layout, module_dir = %config.module_dir.display(), "Starting dex2oat wrapper daemon");

    let table = Arc::new(open_descriptors(&config));
    let wrappers = config.wrappers();
    let mounts = Arc::new(BindMountController::new(wrappers.clone()));
    let policy = Arc::new(SelinuxFs::new(&config.selinuxfs));
    let verifier = MountVerifier::new(&config.container_root, wrappers.clone());

    let mut monitor =
        CompatibilityMonitor::new(table, verifier, mounts, policy, config.enforce_path());
    if let Some(status_path) = &config.status_path {
        monitor = monitor.with_reporter(StatusReporter::new(status_path));
    }
    let monitor = Arc::new(monitor);

    let state = monitor.start();
    if state == CompatibilityState::MountFailed {
        error!(operation = "start_daemon", %state, "Wrapper substitution failed; not serving requests");
        anyhow::bail!("wrapper substitution could not be established");
    }

    let targets = LabelTargets {
        wrappers,
        hook_libraries: config.hook_libraries().into_iter().map(|(_, path)| path).collect(),
    };
    let denylist = Arc::new(FileDenylist::new(&config.denylist_path));
    let server = RequestServer::bind(&config, &targets, monitor.clone(), denylist)
        .context("failed to start request server")?;
    let watcher = MacStatusWatcher::new(
        monitor.clone(),
        [config.enforce_path(), config.policy_path()],
    );

    // Set up signal handlers for graceful shutdown
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!(operation = "shutdown", signal = "SIGINT", "Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!(operation = "shutdown", signal = "SIGTERM", "Received SIGTERM, shutting down");
            }
        }
    };

    supervisor::run(server, watcher, monitor, shutdown).await?;
    Ok(())
}

fn open_descriptors(config: &DaemonConfig) -> DescriptorTable {
    let mut table = DescriptorTable::new();
    for (slot, path) in config.compiler_binaries() {
        table.open(slot, path);
    }
    for (slot, path) in config.hook_libraries() {
        table.open(slot, path);
    }
    info!(operation = "open_descriptors", opened = table.opened().count(), "Pre-opened compiler binaries and hooks");
    table
}
