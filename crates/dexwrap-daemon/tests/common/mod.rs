// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Common helpers for integration tests
//!
//! Mounting is simulated with hard links: an "enabled" compiler path is a
//! link to its wrapper, so device/inode verification behaves as it does
//! with a real bind mount. The real compiler is renamed aside meanwhile.

#![allow(dead_code)]

use dexwrap_daemon::compat::CompatibilityMonitor;
use dexwrap_daemon::config::{ArtLayout, DaemonConfig, WrapperPaths};
use dexwrap_daemon::denylist::FileDenylist;
use dexwrap_daemon::server::{LabelTargets, RequestServer};
use dexwrap_daemon::platform::{MountController, SecurityPolicy, labels};
use dexwrap_daemon::slots::{DescriptorTable, Slot};
use dexwrap_daemon::status::StatusReporter;
use dexwrap_daemon::verify::MountVerifier;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const REAL_COMPILER: &[u8] = b"real compiler";

fn same_inode(a: &Path, b: &Path) -> bool {
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// Where an enabled substitution keeps the real compiler it covers.
fn hidden_path(target: &Path) -> PathBuf {
    let mut hidden = target.as_os_str().to_owned();
    hidden.push(".real");
    PathBuf::from(hidden)
}

pub struct LinkMounts {
    wrappers: WrapperPaths,
    pub fail_enable: AtomicBool,
    pub calls: Mutex<Vec<bool>>,
}

impl LinkMounts {
    pub fn new(wrappers: WrapperPaths) -> Self {
        Self {
            wrappers,
            fail_enable: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<bool> {
        self.calls.lock().unwrap().clone()
    }
}

impl MountController for LinkMounts {
    fn set_substitution(&self, enabled: bool, targets: [Option<&Path>; 4]) {
        self.calls.lock().unwrap().push(enabled);
        for (slot, target) in Slot::COMPILERS.into_iter().zip(targets) {
            let Some(target) = target else {
                continue;
            };
            let wrapper = self.wrappers.for_slot(slot);
            let hidden = hidden_path(target);
            if enabled {
                if self.fail_enable.load(Ordering::SeqCst) || same_inode(wrapper, target) {
                    continue;
                }
                fs::rename(target, &hidden).unwrap();
                fs::hard_link(wrapper, target).unwrap();
            } else if same_inode(wrapper, target) {
                // Renames only: disabling must work even when no descriptor can be opened
                fs::remove_file(target).unwrap();
                if hidden.exists() {
                    fs::rename(&hidden, target).unwrap();
                } else {
                    fs::write(target, REAL_COMPILER).unwrap();
                }
            }
        }
    }
}

#[derive(Default)]
pub struct FakePolicy {
    /// Answer for untrusted apps executing the real compiler
    pub permits_direct_exec: AtomicBool,
    /// Answer for the compiler domain executing a wrapper without transition
    pub compiler_may_exec_wrapper: AtomicBool,
    pub file_contexts: Mutex<Vec<(PathBuf, String)>>,
    pub sock_contexts: Mutex<Vec<Option<String>>>,
}

impl FakePolicy {
    pub fn file_context(&self, path: &Path) -> Option<String> {
        self.file_contexts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(labeled, _)| labeled == path)
            .map(|(_, context)| context.clone())
    }
}

impl SecurityPolicy for FakePolicy {
    fn check_access(&self, scontext: &str, tcontext: &str, tclass: &str, _perm: &str) -> bool {
        assert_eq!(tcontext, labels::DEX2OAT_EXEC);
        assert_eq!(tclass, "file");
        if scontext == labels::DEX2OAT {
            self.compiler_may_exec_wrapper.load(Ordering::SeqCst)
        } else {
            self.permits_direct_exec.load(Ordering::SeqCst)
        }
    }

    fn set_file_context(&self, path: &Path, context: &str) -> bool {
        self.file_contexts
            .lock()
            .unwrap()
            .push((path.to_path_buf(), context.to_string()));
        true
    }

    fn set_sock_create_context(&self, context: Option<&str>) -> bool {
        self.sock_contexts
            .lock()
            .unwrap()
            .push(context.map(str::to_string));
        true
    }
}

/// A fake device: APEX compilers, module wrappers and hooks, selinuxfs files.
pub struct Fixture {
    pub dir: TempDir,
    pub config: DaemonConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let config = DaemonConfig {
            art_layout: ArtLayout::Art,
            apex_root: root.join("apex"),
            module_dir: root.join("module"),
            selinuxfs: root.join("selinux"),
            // Paths are already absolute in the test's own namespace
            container_root: PathBuf::new(),
            socket_path: root.join("socket/dexwrap"),
            denylist_path: root.join("denylist"),
            status_path: Some(root.join("status.json")),
        };

        for (_, binary) in config.compiler_binaries() {
            fs::create_dir_all(binary.parent().unwrap()).unwrap();
            fs::write(&binary, REAL_COMPILER).unwrap();
        }
        let wrappers = config.wrappers();
        fs::create_dir_all(wrappers.wrapper32.parent().unwrap()).unwrap();
        fs::write(&wrappers.wrapper32, b"wrapper32").unwrap();
        fs::write(&wrappers.wrapper64, b"wrapper64").unwrap();
        for (slot, hook) in config.hook_libraries() {
            fs::write(&hook, format!("{slot}")).unwrap();
        }

        fs::create_dir_all(&config.selinuxfs).unwrap();
        fs::write(config.enforce_path(), "1").unwrap();
        fs::write(config.policy_path(), "policy").unwrap();

        Self { dir, config }
    }

    pub fn set_enforcing(&self, enforcing: bool) {
        fs::write(self.config.enforce_path(), if enforcing { "1" } else { "0" }).unwrap();
    }

    pub fn table(&self) -> DescriptorTable {
        let mut table = DescriptorTable::new();
        for (slot, path) in self.config.compiler_binaries() {
            table.open(slot, path);
        }
        for (slot, path) in self.config.hook_libraries() {
            table.open(slot, path);
        }
        table
    }

    pub fn mounts(&self) -> Arc<LinkMounts> {
        Arc::new(LinkMounts::new(self.config.wrappers()))
    }

    pub fn monitor(
        &self,
        table: DescriptorTable,
        mounts: Arc<LinkMounts>,
        policy: Arc<FakePolicy>,
    ) -> Arc<CompatibilityMonitor> {
        let verifier = MountVerifier::new(&self.config.container_root, self.config.wrappers());
        let mut monitor = CompatibilityMonitor::new(
            Arc::new(table),
            verifier,
            mounts,
            policy,
            self.config.enforce_path(),
        );
        if let Some(status_path) = &self.config.status_path {
            monitor = monitor.with_reporter(StatusReporter::new(status_path));
        }
        Arc::new(monitor)
    }

    pub fn label_targets(&self) -> LabelTargets {
        LabelTargets {
            wrappers: self.config.wrappers(),
            hook_libraries: self
                .config
                .hook_libraries()
                .into_iter()
                .map(|(_, path)| path)
                .collect(),
        }
    }

    pub fn bind_server(&self, monitor: Arc<CompatibilityMonitor>) -> RequestServer {
        let denylist = Arc::new(FileDenylist::new(&self.config.denylist_path));
        RequestServer::bind(&self.config, &self.label_targets(), monitor, denylist).expect("bind")
    }

    pub fn compiler_is_wrapped(&self, slot: Slot) -> bool {
        let binary = self
            .config
            .compiler_binaries()
            .into_iter()
            .find(|(candidate, _)| *candidate == slot)
            .map(|(_, path)| path)
            .unwrap();
        same_inode(&binary, self.config.wrappers().for_slot(slot))
    }
}
