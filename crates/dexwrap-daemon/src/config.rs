// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem locations the daemon works with
//!
//! Loaded from an optional TOML file; command-line flags are applied on top
//! by the binary.

use crate::error::{DaemonError, Result};
use crate::platform::SocketPathProvider;
use crate::slots::{Abi, Slot};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the daemon publishes its status and where `dexwrap-daemonctl` reads it.
pub const DEFAULT_STATUS_PATH: &str = "/data/adb/dexwrap/status.json";

/// Which ART APEX ships the compiler binaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ArtLayout {
    /// `com.android.runtime`: one `dex2oat`/`dex2oatd` pair matching the daemon's bitness
    Runtime,
    /// `com.android.art`: separate 32 and 64-bit binaries
    #[default]
    Art,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DaemonConfig {
    pub art_layout: ArtLayout,
    pub apex_root: PathBuf,
    /// Directory holding `bin/` with the wrappers and hook libraries
    pub module_dir: PathBuf,
    pub selinuxfs: PathBuf,
    /// Prefix giving the init mount namespace's view of a path
    pub container_root: PathBuf,
    pub socket_path: PathBuf,
    pub denylist_path: PathBuf,
    pub status_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            art_layout: ArtLayout::default(),
            apex_root: PathBuf::from("/apex"),
            module_dir: PathBuf::from("/data/adb/modules/dexwrap"),
            selinuxfs: PathBuf::from("/sys/fs/selinux"),
            container_root: PathBuf::from("/proc/1/root"),
            socket_path: PathBuf::from(dexwrap_proto::DEFAULT_SOCKET_PATH),
            denylist_path: PathBuf::from("/data/adb/dexwrap/denylist"),
            status_path: Some(PathBuf::from(DEFAULT_STATUS_PATH)),
        }
    }
}

/// The two wrapper binaries bind-mounted over the real compilers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrapperPaths {
    pub wrapper32: PathBuf,
    pub wrapper64: PathBuf,
}

impl WrapperPaths {
    pub fn for_slot(&self, slot: Slot) -> &Path {
        match slot.abi() {
            Abi::Bits32 => &self.wrapper32,
            Abi::Bits64 => &self.wrapper64,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| DaemonError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| DaemonError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Compiler binaries to pre-open, with the slot each one occupies.
    pub fn compiler_binaries(&self) -> Vec<(Slot, PathBuf)> {
        match self.art_layout {
            ArtLayout::Runtime => {
                let bin = self.apex_root.join("com.android.runtime/bin");
                let (release, debug) = if cfg!(target_pointer_width = "64") {
                    (Slot::Release64, Slot::Debug64)
                } else {
                    (Slot::Release32, Slot::Debug32)
                };
                vec![(release, bin.join("dex2oat")), (debug, bin.join("dex2oatd"))]
            }
            ArtLayout::Art => {
                let bin = self.apex_root.join("com.android.art/bin");
                vec![
                    (Slot::Release32, bin.join("dex2oat32")),
                    (Slot::Debug32, bin.join("dex2oatd32")),
                    (Slot::Release64, bin.join("dex2oat64")),
                    (Slot::Debug64, bin.join("dex2oatd64")),
                ]
            }
        }
    }

    pub fn hook_libraries(&self) -> [(Slot, PathBuf); 2] {
        let bin = self.module_dir.join("bin");
        [
            (Slot::Hook32, bin.join("liboat_hook32.so")),
            (Slot::Hook64, bin.join("liboat_hook64.so")),
        ]
    }

    pub fn wrappers(&self) -> WrapperPaths {
        let bin = self.module_dir.join("bin");
        WrapperPaths {
            wrapper32: bin.join("dex2oat32"),
            wrapper64: bin.join("dex2oat64"),
        }
    }

    pub fn enforce_path(&self) -> PathBuf {
        self.selinuxfs.join("enforce")
    }

    pub fn policy_path(&self) -> PathBuf {
        self.selinuxfs.join("policy")
    }
}

impl SocketPathProvider for DaemonConfig {
    fn socket_path(&self) -> PathBuf {
        self.socket_path.clone()
    }
}
