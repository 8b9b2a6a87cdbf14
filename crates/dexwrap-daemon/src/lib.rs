// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Privileged daemon backing the dex2oat wrappers
//!
//! The daemon pre-opens the real compiler binaries and hook libraries,
//! bind-mounts the wrappers over the compilers, and hands descriptors to
//! wrapper processes over a Unix socket. A compatibility monitor withdraws
//! the substitution when SELinux no longer confines direct execution of the
//! real compiler, and restores it when confinement returns.

pub mod compat;
pub mod config;
pub mod denylist;
pub mod error;
pub mod platform;
pub mod server;
pub mod slots;
pub mod status;
pub mod supervisor;
pub mod verify;
pub mod watcher;

pub use compat::{CompatibilityMonitor, CompatibilityState, WatchDirective};
pub use config::{ArtLayout, DaemonConfig, WrapperPaths};
pub use error::{DaemonError, Result};
pub use server::{LabelTargets, RequestServer};
pub use slots::{DescriptorTable, Slot};
pub use watcher::MacStatusWatcher;
