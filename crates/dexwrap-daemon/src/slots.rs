// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pre-opened descriptors handed out to compiler processes
//!
//! Each slot is opened at most once, before the server starts, and stays
//! open until the daemon exits. A failed open leaves the slot empty.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Slot {
    Release32 = 0,
    Debug32 = 1,
    Release64 = 2,
    Debug64 = 3,
    Hook32 = 4,
    Hook64 = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Abi {
    Bits32,
    Bits64,
}

impl Slot {
    pub const ALL: [Slot; 6] = [
        Slot::Release32,
        Slot::Debug32,
        Slot::Release64,
        Slot::Debug64,
        Slot::Hook32,
        Slot::Hook64,
    ];

    pub const COMPILERS: [Slot; 4] = [
        Slot::Release32,
        Slot::Debug32,
        Slot::Release64,
        Slot::Debug64,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_compiler(self) -> bool {
        self.index() < 4
    }

    pub fn abi(self) -> Abi {
        match self {
            Slot::Release32 | Slot::Debug32 | Slot::Hook32 => Abi::Bits32,
            Slot::Release64 | Slot::Debug64 | Slot::Hook64 => Abi::Bits64,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Slot::Release32 => "dex2oat32",
            Slot::Debug32 => "dex2oatd32",
            Slot::Release64 => "dex2oat64",
            Slot::Debug64 => "dex2oatd64",
            Slot::Hook32 => "liboat_hook32",
            Slot::Hook64 => "liboat_hook64",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct SlotEntry {
    path: PathBuf,
    file: File,
}

#[derive(Debug, Default)]
pub struct DescriptorTable {
    entries: [Option<SlotEntry>; 6],
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` read-only into `slot`. Failures are logged and leave the slot empty.
    pub fn open(&mut self, slot: Slot, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if let Some(existing) = &self.entries[slot.index()] {
            warn!(operation = "descriptor_open", %slot, path = %path.display(), existing = %existing.path.display(), "Slot already opened; keeping existing descriptor");
            return;
        }

        match File::open(path) {
            Ok(file) => {
                debug!(operation = "descriptor_open", %slot, path = %path.display(), "Opened descriptor");
                self.entries[slot.index()] = Some(SlotEntry {
                    path: path.to_path_buf(),
                    file,
                });
            }
            Err(e) => {
                warn!(operation = "descriptor_open", %slot, path = %path.display(), error = %e, "Failed to open descriptor; slot left empty");
            }
        }
    }

    pub fn get(&self, slot: Slot) -> Option<BorrowedFd<'_>> {
        self.entries[slot.index()].as_ref().map(|entry| entry.file.as_fd())
    }

    pub fn path(&self, slot: Slot) -> Option<&Path> {
        self.entries[slot.index()].as_ref().map(|entry| entry.path.as_path())
    }

    /// Recorded paths of the four compiler slots, indexed like [`Slot::COMPILERS`].
    pub fn compiler_paths(&self) -> [Option<&Path>; 4] {
        Slot::COMPILERS.map(|slot| self.path(slot))
    }

    pub fn opened(&self) -> impl Iterator<Item = Slot> + '_ {
        Slot::ALL.into_iter().filter(|slot| self.get(*slot).is_some())
    }
}
