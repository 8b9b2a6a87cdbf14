// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Compatibility state machine
//!
//! Tracks whether the wrapper substitution is active and safe, reacting to
//! SELinux status changes and to a fatal failure of the request server.
//!
//! ```text
//!            permissive / policy permits direct exec
//!   OK  ───────────────────────────────────────────▶  MAC_PERMISSIVE
//!    ▲                                                MAC_POLICY_PERMITS_DIRECT_EXEC
//!    │   enforcing + restrictive, remount verified           │
//!    └───────────────────────────────────────────────────────┘
//!                                                            │ remount not verified
//!   OK ── server crash ──▶ CRASHED (terminal)                ▼
//!                                                     MOUNT_FAILED (terminal)
//! ```

use crate::platform::{MountController, SecurityPolicy, labels};
use crate::slots::DescriptorTable;
use crate::status::StatusReporter;
use crate::verify::MountVerifier;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CompatibilityState {
    Ok = 0,
    Crashed = 1,
    MountFailed = 2,
    MacPermissive = 3,
    MacPolicyPermitsDirectExec = 4,
}

impl CompatibilityState {
    pub fn as_code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CompatibilityState::Ok),
            1 => Some(CompatibilityState::Crashed),
            2 => Some(CompatibilityState::MountFailed),
            3 => Some(CompatibilityState::MacPermissive),
            4 => Some(CompatibilityState::MacPolicyPermitsDirectExec),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CompatibilityState::Crashed | CompatibilityState::MountFailed
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            CompatibilityState::Ok => "OK",
            CompatibilityState::Crashed => "CRASHED",
            CompatibilityState::MountFailed => "MOUNT_FAILED",
            CompatibilityState::MacPermissive => "MAC_PERMISSIVE",
            CompatibilityState::MacPolicyPermitsDirectExec => "MAC_POLICY_PERMITS_DIRECT_EXEC",
        }
    }
}

impl std::fmt::Display for CompatibilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// SELinux conditions sampled for one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacStatus {
    pub enforcing: bool,
    pub policy_permits_direct_exec: bool,
}

/// What the state machine does in response to a MAC status event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Terminal state reached earlier; stop watching.
    Halt,
    /// Substitution is deliberately inactive; disable it first if `disable`.
    Degrade {
        next: CompatibilityState,
        disable: bool,
    },
    /// Enable the substitution again and verify it.
    Remount,
    /// Steady state.
    Stay,
}

/// Pure transition table: same prior state and MAC status always give the same plan.
pub fn plan_transition(prior: CompatibilityState, mac: MacStatus) -> Transition {
    if prior.is_terminal() {
        return Transition::Halt;
    }
    if !mac.enforcing {
        return Transition::Degrade {
            next: CompatibilityState::MacPermissive,
            disable: prior == CompatibilityState::Ok,
        };
    }
    if mac.policy_permits_direct_exec {
        return Transition::Degrade {
            next: CompatibilityState::MacPolicyPermitsDirectExec,
            disable: prior == CompatibilityState::Ok,
        };
    }
    if prior != CompatibilityState::Ok {
        return Transition::Remount;
    }
    Transition::Stay
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchDirective {
    Continue,
    Stop,
}

/// Reads the enforcement flag; anything but a leading `'1'`, including a
/// read error, counts as permissive.
pub fn read_enforcing(path: &Path) -> bool {
    let mut flag = [0u8; 1];
    match std::fs::File::open(path).and_then(|mut file| file.read_exact(&mut flag)) {
        Ok(()) => flag[0] == b'1',
        Err(e) => {
            warn!(operation = "read_enforce", path = %path.display(), error = %e, "Failed to read enforcement flag; assuming permissive");
            false
        }
    }
}

pub struct CompatibilityMonitor {
    state: AtomicU8,
    transition_lock: Mutex<()>,
    table: Arc<DescriptorTable>,
    verifier: MountVerifier,
    mounts: Arc<dyn MountController>,
    policy: Arc<dyn SecurityPolicy>,
    enforce_path: PathBuf,
    reporter: Option<StatusReporter>,
}

impl CompatibilityMonitor {
    pub fn new(
        table: Arc<DescriptorTable>,
        verifier: MountVerifier,
        mounts: Arc<dyn MountController>,
        policy: Arc<dyn SecurityPolicy>,
        enforce_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state: AtomicU8::new(CompatibilityState::Ok.as_code()),
            transition_lock: Mutex::new(()),
            table,
            verifier,
            mounts,
            policy,
            enforce_path: enforce_path.into(),
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: StatusReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Current state; safe to call from any thread.
    pub fn state(&self) -> CompatibilityState {
        CompatibilityState::from_code(self.state.load(Ordering::Acquire))
            .unwrap_or(CompatibilityState::Crashed)
    }

    pub fn table(&self) -> &Arc<DescriptorTable> {
        &self.table
    }

    fn set_state(&self, next: CompatibilityState) {
        let prior = CompatibilityState::from_code(self.state.swap(next.as_code(), Ordering::AcqRel));
        if prior != Some(next) {
            info!(operation = "compat_transition", prior = ?prior, next = %next, "Compatibility state changed");
        }
        if let Some(reporter) = &self.reporter {
            reporter.publish(next);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // Guards no data, poisoning is irrelevant
        self.transition_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_substitution(&self, enabled: bool) {
        debug!(operation = "set_substitution", enabled, "Toggling wrapper substitution");
        self.mounts
            .set_substitution(enabled, self.table.compiler_paths());
    }

    pub fn is_substitution_active(&self) -> bool {
        self.verifier.is_substitution_active(&self.table)
    }

    /// Whether `scontext` may execute the real compiler without going through a wrapper.
    pub fn permits_direct_exec(&self, scontext: &str) -> bool {
        self.policy
            .check_access(scontext, labels::DEX2OAT_EXEC, "file", "execute")
            || self
                .policy
                .check_access(scontext, labels::DEX2OAT_EXEC, "file", "execute_no_trans")
    }

    pub fn policy(&self) -> &Arc<dyn SecurityPolicy> {
        &self.policy
    }

    pub fn sample_mac_status(&self) -> MacStatus {
        let enforcing = read_enforcing(&self.enforce_path);
        // The policy query only matters when enforcing
        let policy_permits_direct_exec = enforcing && self.permits_direct_exec(labels::UNTRUSTED_APP);
        MacStatus {
            enforcing,
            policy_permits_direct_exec,
        }
    }

    /// Enable the substitution once if needed and verify it.
    ///
    /// Returns the resulting state: `Ok`, or `MountFailed` with the
    /// substitution disabled again.
    pub fn start(&self) -> CompatibilityState {
        let _guard = self.lock();

        if !self.is_substitution_active() {
            self.set_substitution(true);
            if !self.is_substitution_active() {
                self.set_substitution(false);
                error!(operation = "compat_start", "Wrapper substitution could not be established");
                self.set_state(CompatibilityState::MountFailed);
                return CompatibilityState::MountFailed;
            }
        } else {
            info!(operation = "compat_start", "Wrapper substitution already active");
        }

        self.set_state(CompatibilityState::Ok);
        CompatibilityState::Ok
    }

    /// Handle a write to one of the SELinux control files.
    pub fn on_mac_status_changed(&self) -> WatchDirective {
        let _guard = self.lock();

        let prior = self.state();
        if prior.is_terminal() {
            debug!(operation = "mac_status_changed", state = %prior, "Ignoring event in terminal state");
            return WatchDirective::Stop;
        }

        let mac = self.sample_mac_status();
        debug!(operation = "mac_status_changed", state = %prior, enforcing = mac.enforcing, policy_permits_direct_exec = mac.policy_permits_direct_exec, "SELinux status changed");
        self.apply(prior, mac)
    }

    fn apply(&self, prior: CompatibilityState, mac: MacStatus) -> WatchDirective {
        match plan_transition(prior, mac) {
            Transition::Halt => WatchDirective::Stop,
            Transition::Degrade { next, disable } => {
                if disable {
                    self.set_substitution(false);
                }
                self.set_state(next);
                WatchDirective::Continue
            }
            Transition::Remount => {
                self.set_substitution(true);
                if self.is_substitution_active() {
                    self.set_state(CompatibilityState::Ok);
                    WatchDirective::Continue
                } else {
                    self.set_substitution(false);
                    self.set_state(CompatibilityState::MountFailed);
                    WatchDirective::Stop
                }
            }
            Transition::Stay => WatchDirective::Continue,
        }
    }

    /// The request server's accept loop died.
    pub fn on_server_crashed(&self) {
        let _guard = self.lock();
        if self.state() == CompatibilityState::Ok {
            self.set_substitution(false);
            self.set_state(CompatibilityState::Crashed);
        }
    }

    /// Graceful shutdown: wrappers cannot work without the daemon.
    ///
    /// The published status is removed so nothing reports a daemon that
    /// has exited.
    pub fn on_shutdown(&self) {
        let _guard = self.lock();
        if self.state() == CompatibilityState::Ok {
            info!(operation = "compat_shutdown", "Disabling wrapper substitution before exit");
            self.set_substitution(false);
        }
        if let Some(reporter) = &self.reporter {
            reporter.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CompatibilityState::*;

    const ALL_STATES: [CompatibilityState; 5] =
        [Ok, Crashed, MountFailed, MacPermissive, MacPolicyPermitsDirectExec];

    fn mac(enforcing: bool, policy_permits_direct_exec: bool) -> MacStatus {
        MacStatus {
            enforcing,
            policy_permits_direct_exec,
        }
    }

    #[test]
    fn terminal_states_halt_for_every_input() {
        for prior in [Crashed, MountFailed] {
            for enforcing in [false, true] {
                for permits in [false, true] {
                    assert_eq!(
                        plan_transition(prior, mac(enforcing, permits)),
                        Transition::Halt
                    );
                }
            }
        }
    }

    #[test]
    fn permissive_disables_only_from_ok() {
        assert_eq!(
            plan_transition(Ok, mac(false, false)),
            Transition::Degrade {
                next: MacPermissive,
                disable: true
            }
        );
        assert_eq!(
            plan_transition(MacPolicyPermitsDirectExec, mac(false, true)),
            Transition::Degrade {
                next: MacPermissive,
                disable: false
            }
        );
    }

    #[test]
    fn permissive_policy_disables_only_from_ok() {
        assert_eq!(
            plan_transition(Ok, mac(true, true)),
            Transition::Degrade {
                next: MacPolicyPermitsDirectExec,
                disable: true
            }
        );
        assert_eq!(
            plan_transition(MacPermissive, mac(true, true)),
            Transition::Degrade {
                next: MacPolicyPermitsDirectExec,
                disable: false
            }
        );
    }

    #[test]
    fn restrictive_enforcing_remounts_degraded_states() {
        assert_eq!(plan_transition(Ok, mac(true, false)), Transition::Stay);
        assert_eq!(
            plan_transition(MacPermissive, mac(true, false)),
            Transition::Remount
        );
        assert_eq!(
            plan_transition(MacPolicyPermitsDirectExec, mac(true, false)),
            Transition::Remount
        );
    }

    #[test]
    fn state_codes_round_trip() {
        for state in ALL_STATES {
            assert_eq!(CompatibilityState::from_code(state.as_code()), Some(state));
        }
        assert_eq!(CompatibilityState::from_code(9), None);
        assert_eq!(MacPolicyPermitsDirectExec.to_string(), "MAC_POLICY_PERMITS_DIRECT_EXEC");
    }

    #[test]
    fn enforce_flag_parsing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enforce = dir.path().join("enforce");

        std::fs::write(&enforce, "1").expect("write");
        assert!(read_enforcing(&enforce));
        std::fs::write(&enforce, "0").expect("write");
        assert!(!read_enforcing(&enforce));
        std::fs::write(&enforce, "").expect("write");
        assert!(!read_enforcing(&enforce));
        assert!(!read_enforcing(&dir.path().join("missing")));
    }
}
