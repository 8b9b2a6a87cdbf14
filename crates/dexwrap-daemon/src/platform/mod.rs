// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Narrow interfaces to the privileged parts of the system
//!
//! Everything that needs root or an SELinux kernel sits behind these
//! traits, so the state machine and the request server run unprivileged
//! in tests.

use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
pub mod linux;

/// SELinux contexts used by the daemon.
pub mod labels {
    pub const UNTRUSTED_APP: &str = "u:r:untrusted_app:s0";
    pub const DEX2OAT: &str = "u:r:dex2oat:s0";
    pub const INSTALLD: &str = "u:r:installd:s0";
    pub const DEX2OAT_EXEC: &str = "u:object_r:dex2oat_exec:s0";
    pub const MODULE_FILE: &str = "u:object_r:xposed_file:s0";
}

/// Enables or disables the bind-mount of the wrappers over the compilers.
///
/// Implementations must be idempotent. Callers never trust the outcome and
/// re-verify through [`crate::verify::MountVerifier`].
pub trait MountController: Send + Sync {
    /// `targets` follows [`crate::slots::Slot::COMPILERS`]; `None` entries are skipped.
    fn set_substitution(&self, enabled: bool, targets: [Option<&Path>; 4]);
}

pub trait SecurityPolicy: Send + Sync {
    /// Whether `scontext` is granted `perm` on `tclass` objects labeled `tcontext`.
    fn check_access(&self, scontext: &str, tcontext: &str, tclass: &str, perm: &str) -> bool;

    fn set_file_context(&self, path: &Path, context: &str) -> bool;

    /// Label for sockets created next by the calling thread; `None` resets it.
    fn set_sock_create_context(&self, context: Option<&str>) -> bool;
}

pub trait SocketPathProvider: Send + Sync {
    fn socket_path(&self) -> PathBuf;
}

impl SocketPathProvider for PathBuf {
    fn socket_path(&self) -> PathBuf {
        self.clone()
    }
}

pub trait Denylist: Send + Sync {
    fn is_denied(&self, process_name: &str) -> bool;
}
