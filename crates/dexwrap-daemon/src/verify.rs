// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Substitution check by device/inode identity
//!
//! A compiler path counts as substituted when, seen through the init mount
//! namespace, it resolves to the same file as its wrapper.

use crate::config::WrapperPaths;
use crate::slots::{DescriptorTable, Slot};
use std::ffi::OsString;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct MountVerifier {
    container_root: PathBuf,
    wrappers: WrapperPaths,
}

impl MountVerifier {
    pub fn new(container_root: impl Into<PathBuf>, wrappers: WrapperPaths) -> Self {
        Self {
            container_root: container_root.into(),
            wrappers,
        }
    }

    pub fn wrappers(&self) -> &WrapperPaths {
        &self.wrappers
    }

    /// `container_root` and `path` are concatenated, not joined: `path` is absolute.
    fn through_container_root(&self, path: &Path) -> PathBuf {
        let mut full = OsString::from(self.container_root.as_os_str());
        full.push(path.as_os_str());
        PathBuf::from(full)
    }

    /// True when every recorded compiler slot resolves to its wrapper.
    ///
    /// Slots that never opened are skipped, so an empty table counts as
    /// substituted.
    pub fn is_substitution_active(&self, table: &DescriptorTable) -> bool {
        for slot in Slot::COMPILERS {
            let Some(binary) = table.path(slot) else {
                continue;
            };

            let target = self.through_container_root(binary);
            let wrapper = self.wrappers.for_slot(slot);
            let identities = FileIdentity::of(&target).and_then(|target_id| {
                FileIdentity::of(wrapper).map(|wrapper_id| (target_id, wrapper_id))
            });

            match identities {
                Ok((target_id, wrapper_id)) if target_id == wrapper_id => {}
                Ok((target_id, wrapper_id)) => {
                    warn!(operation = "verify_mount", %slot, binary = %binary.display(), ?target_id, ?wrapper_id, "Check mount failed: identity mismatch");
                    return false;
                }
                Err(e) => {
                    error!(operation = "verify_mount", %slot, binary = %binary.display(), error = %e, "Check mount failed");
                    return false;
                }
            }
        }

        debug!(operation = "verify_mount", "Check mount succeeded");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        wrappers: WrapperPaths,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let root = dir.path().join("root");
            let bin = dir.path().join("module/bin");
            fs::create_dir_all(root.join("apex/bin")).expect("apex dir");
            fs::create_dir_all(&bin).expect("bin dir");
            let wrappers = WrapperPaths {
                wrapper32: bin.join("dex2oat32"),
                wrapper64: bin.join("dex2oat64"),
            };
            fs::write(&wrappers.wrapper32, b"wrapper32").expect("wrapper32");
            fs::write(&wrappers.wrapper64, b"wrapper64").expect("wrapper64");
            Self {
                _dir: dir,
                root,
                wrappers,
            }
        }

        /// Create a compiler binary as seen from inside the container root.
        fn binary(&self, name: &str, linked_to: Option<&Path>) -> PathBuf {
            let logical = PathBuf::from("/apex/bin").join(name);
            let physical = self.root.join(logical.strip_prefix("/").expect("absolute"));
            match linked_to {
                Some(wrapper) => fs::hard_link(wrapper, &physical).expect("hard link"),
                None => fs::write(&physical, name).expect("binary"),
            }
            logical
        }

        fn verifier(&self) -> MountVerifier {
            MountVerifier::new(&self.root, self.wrappers.clone())
        }
    }

    #[test]
    fn empty_table_counts_as_substituted() {
        let fixture = Fixture::new();
        assert!(fixture.verifier().is_substitution_active(&DescriptorTable::new()));
    }

    #[test]
    fn all_slots_linked_to_matching_wrapper() {
        let fixture = Fixture::new();
        let w32 = fixture.wrappers.wrapper32.clone();
        let w64 = fixture.wrappers.wrapper64.clone();
        let mut table = DescriptorTable::new();
        for (slot, name, wrapper) in [
            (Slot::Release32, "dex2oat32", &w32),
            (Slot::Debug32, "dex2oatd32", &w32),
            (Slot::Release64, "dex2oat64", &w64),
            (Slot::Debug64, "dex2oatd64", &w64),
        ] {
            let logical = fixture.binary(name, Some(wrapper));
            table.open(slot, fixture.root.join(logical.strip_prefix("/").unwrap()));
        }

        // The table records physical paths; make the verifier see them through an empty root
        let verifier = MountVerifier::new("", fixture.wrappers.clone());
        assert!(verifier.is_substitution_active(&table));
    }

    #[test]
    fn single_mismatch_forces_false() {
        let fixture = Fixture::new();
        let w32 = fixture.wrappers.wrapper32.clone();
        let mut table = DescriptorTable::new();
        let good = fixture.binary("dex2oat32", Some(&w32));
        let bad = fixture.binary("dex2oatd32", None);
        table.open(Slot::Release32, fixture.root.join(good.strip_prefix("/").unwrap()));
        table.open(Slot::Debug32, fixture.root.join(bad.strip_prefix("/").unwrap()));

        let verifier = MountVerifier::new("", fixture.wrappers.clone());
        assert!(!verifier.is_substitution_active(&table));
    }

    #[test]
    fn wrong_bitness_wrapper_is_a_mismatch() {
        let fixture = Fixture::new();
        let w32 = fixture.wrappers.wrapper32.clone();
        let mut table = DescriptorTable::new();
        let logical = fixture.binary("dex2oat64", Some(&w32));
        table.open(Slot::Release64, fixture.root.join(logical.strip_prefix("/").unwrap()));

        let verifier = MountVerifier::new("", fixture.wrappers.clone());
        assert!(!verifier.is_substitution_active(&table));
    }

    #[test]
    fn container_root_prefix_is_applied() {
        let fixture = Fixture::new();
        let w64 = fixture.wrappers.wrapper64.clone();
        let logical = fixture.binary("dex2oat64", Some(&w64));

        let verifier = fixture.verifier();
        assert_eq!(
            verifier.through_container_root(&logical),
            fixture.root.join("apex/bin/dex2oat64")
        );
        assert_eq!(
            FileIdentity::of(&verifier.through_container_root(&logical)).unwrap(),
            FileIdentity::of(&w64).unwrap()
        );
    }

    #[test]
    fn missing_wrapper_fails_verification() {
        let fixture = Fixture::new();
        let w64 = fixture.wrappers.wrapper64.clone();
        let mut table = DescriptorTable::new();
        let logical = fixture.binary("dex2oat64", Some(&w64));
        table.open(Slot::Release64, fixture.root.join(logical.strip_prefix("/").unwrap()));
        fs::remove_file(&w64).expect("remove wrapper");

        let verifier = MountVerifier::new("", fixture.wrappers.clone());
        assert!(!verifier.is_substitution_active(&table));
    }
}
