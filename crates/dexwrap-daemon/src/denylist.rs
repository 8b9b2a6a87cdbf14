// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::platform::Denylist;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Default)]
struct Snapshot {
    modified: Option<SystemTime>,
    names: HashSet<String>,
}

/// Process names excluded from injection, one per line.
///
/// The file is re-read whenever its modification time changes. A missing
/// file is an empty denylist.
pub struct FileDenylist {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl FileDenylist {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(contents: &str) -> HashSet<String> {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    fn refresh(&self, snapshot: &mut Snapshot) {
        let modified = match std::fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => Some(modified),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(operation = "denylist_refresh", path = %self.path.display(), error = %e, "Failed to stat denylist; keeping previous entries");
                return;
            }
        };

        if modified == snapshot.modified {
            return;
        }

        let names = match modified {
            Some(_) => match std::fs::read_to_string(&self.path) {
                Ok(contents) => Self::parse(&contents),
                Err(e) => {
                    warn!(operation = "denylist_refresh", path = %self.path.display(), error = %e, "Failed to read denylist; keeping previous entries");
                    return;
                }
            },
            None => HashSet::new(),
        };

        debug!(operation = "denylist_refresh", path = %self.path.display(), entries = names.len(), "Loaded denylist");
        snapshot.modified = modified;
        snapshot.names = names;
    }
}

impl Denylist for FileDenylist {
    fn is_denied(&self, process_name: &str) -> bool {
        if process_name.is_empty() {
            return false;
        }
        let mut snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.refresh(&mut snapshot);
        snapshot.names.contains(process_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn missing_file_denies_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let denylist = FileDenylist::new(dir.path().join("denylist"));
        assert!(!denylist.is_denied("com.android.systemui"));
        assert!(!denylist.is_denied(""));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("denylist");
        std::fs::write(&path, "# banking\ncom.bank.app\n\n  com.game.anticheat  \n").expect("write");

        let denylist = FileDenylist::new(&path);
        assert!(denylist.is_denied("com.bank.app"));
        assert!(denylist.is_denied("com.game.anticheat"));
        assert!(!denylist.is_denied("# banking"));
        assert!(!denylist.is_denied("com.example"));
    }

    #[test]
    fn changes_are_picked_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("denylist");
        std::fs::write(&path, "com.first\n").expect("write");

        let denylist = FileDenylist::new(&path);
        assert!(denylist.is_denied("com.first"));

        std::fs::write(&path, "com.second\n").expect("rewrite");
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(later))
            .expect("bump mtime");

        assert!(!denylist.is_denied("com.first"));
        assert!(denylist.is_denied("com.second"));

        std::fs::remove_file(&path).expect("remove");
        assert!(!denylist.is_denied("com.second"));
    }
}
