// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::config::WrapperPaths;
use crate::platform::{MountController, SecurityPolicy};
use crate::slots::Slot;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::ffi::CString;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SELINUX_XATTR: &str = "security.selinux";
const SOCKCREATE_ATTR: &str = "/proc/thread-self/attr/sockcreate";

/// Bind-mounts wrappers over compiler binaries in the daemon's mount namespace.
pub struct BindMountController {
    wrappers: WrapperPaths,
}

impl BindMountController {
    pub fn new(wrappers: WrapperPaths) -> Self {
        Self { wrappers }
    }

    fn same_file(a: &Path, b: &Path) -> bool {
        match (std::fs::metadata(a), std::fs::metadata(b)) {
            (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
            _ => false,
        }
    }

    fn bind(&self, wrapper: &Path, target: &Path) {
        if Self::same_file(wrapper, target) {
            debug!(operation = "bind_wrapper", target = %target.display(), "Wrapper already mounted");
            return;
        }

        match mount(
            Some(wrapper),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            Ok(()) => {
                info!(operation = "bind_wrapper", wrapper = %wrapper.display(), target = %target.display(), "Mounted wrapper");
            }
            Err(e) => {
                warn!(operation = "bind_wrapper", wrapper = %wrapper.display(), target = %target.display(), error = %e, "Failed to mount wrapper");
            }
        }
    }

    fn unbind(&self, target: &Path) {
        match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) => {
                info!(operation = "unbind_wrapper", target = %target.display(), "Unmounted wrapper");
            }
            // Not a mount point: nothing to undo
            Err(Errno::EINVAL) => {
                debug!(operation = "unbind_wrapper", target = %target.display(), "Wrapper not mounted");
            }
            Err(e) => {
                warn!(operation = "unbind_wrapper", target = %target.display(), error = %e, "Failed to unmount wrapper");
            }
        }
    }
}

impl MountController for BindMountController {
    fn set_substitution(&self, enabled: bool, targets: [Option<&Path>; 4]) {
        for (slot, target) in Slot::COMPILERS.into_iter().zip(targets) {
            let Some(target) = target else {
                continue;
            };
            if enabled {
                self.bind(self.wrappers.for_slot(slot), target);
            } else {
                self.unbind(target);
            }
        }
    }
}

/// SELinux operations through selinuxfs, xattrs and procfs.
pub struct SelinuxFs {
    root: PathBuf,
}

impl SelinuxFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_number(path: &Path) -> std::io::Result<u32> {
        let contents = std::fs::read_to_string(path)?;
        contents
            .trim()
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn compute_access(
        &self,
        scontext: &str,
        tcontext: &str,
        tclass: &str,
        perm: &str,
    ) -> std::io::Result<bool> {
        let class_dir = self.root.join("class").join(tclass);
        let class_index = Self::read_number(&class_dir.join("index"))?;
        let perm_value = Self::read_number(&class_dir.join("perms").join(perm))?;
        if perm_value == 0 || perm_value > 32 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("permission {perm} has value {perm_value}"),
            ));
        }
        let perm_bit = 1u32 << (perm_value - 1);

        let mut access = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.root.join("access"))?;
        access.write_all(format!("{scontext} {tcontext} {class_index}").as_bytes())?;

        let mut response = String::new();
        access.read_to_string(&mut response)?;
        // allowed decided auditallow auditdeny seqno flags
        let allowed = response
            .split_whitespace()
            .next()
            .and_then(|field| u32::from_str_radix(field, 16).ok())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("malformed access response: {response:?}"),
                )
            })?;

        Ok(allowed & perm_bit != 0)
    }
}

impl SecurityPolicy for SelinuxFs {
    fn check_access(&self, scontext: &str, tcontext: &str, tclass: &str, perm: &str) -> bool {
        match self.compute_access(scontext, tcontext, tclass, perm) {
            Ok(allowed) => {
                debug!(operation = "check_access", scontext, tcontext, tclass, perm, allowed, "Computed access");
                allowed
            }
            Err(e) => {
                warn!(operation = "check_access", scontext, tcontext, tclass, perm, error = %e, "Access check failed; treating as denied");
                false
            }
        }
    }

    fn set_file_context(&self, path: &Path, context: &str) -> bool {
        let (Ok(c_path), Ok(c_name), Ok(c_value)) = (
            CString::new(path.as_os_str().as_bytes()),
            CString::new(SELINUX_XATTR),
            CString::new(context),
        ) else {
            warn!(operation = "set_file_context", path = %path.display(), context, "Path or context contains NUL");
            return false;
        };

        let value = c_value.as_bytes_with_nul();
        // SAFETY: all pointers come from live CStrings and the length matches the value buffer.
        let rc = unsafe {
            libc::lsetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if rc != 0 {
            warn!(operation = "set_file_context", path = %path.display(), context, error = %std::io::Error::last_os_error(), "Failed to set file context");
            return false;
        }
        debug!(operation = "set_file_context", path = %path.display(), context, "Set file context");
        true
    }

    fn set_sock_create_context(&self, context: Option<&str>) -> bool {
        let result = std::fs::OpenOptions::new()
            .write(true)
            .open(SOCKCREATE_ATTR)
            .and_then(|file| match context {
                Some(context) => {
                    let mut value = context.as_bytes().to_vec();
                    value.push(0);
                    (&file).write_all(&value)
                }
                // A zero-length write resets the attribute; write_all would skip the syscall
                None => nix::unistd::write(file.as_fd(), &[])
                    .map(|_| ())
                    .map_err(std::io::Error::from),
            });

        match result {
            Ok(()) => {
                debug!(operation = "set_sock_create_context", context = ?context, "Set socket creation context");
                true
            }
            Err(e) => {
                warn!(operation = "set_sock_create_context", context = ?context, error = %e, "Failed to set socket creation context");
                false
            }
        }
    }
}
