//! Snapshot ring bookkeeping: sortable timestamped names, a bounded
//! backlog, and the reserved `temp.db` slot for the last revertable load.
//!
//! The actual file copies and connection swaps live on [`Store`], which
//! owns the database lock.
//!
//! [`Store`]: crate::Store

use std::path::{Path, PathBuf};

use chrono::{DateTime, Timelike, Utc};

use crate::error::Result;

/// Reserved file name holding the database that was live immediately
/// before the most recent snapshot load.
pub const TEMP_SNAPSHOT: &str = "temp.db";

pub struct SnapshotRing {
    dir: PathBuf,
    backlog: usize,
    names: Vec<String>,
}

impl SnapshotRing {
    /// Scan `dir` for existing snapshots, oldest first. Timestamped names
    /// sort lexicographically, so a plain sort restores the ring order.
    pub fn open(dir: &Path, backlog: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".db") && name != TEMP_SNAPSHOT {
                names.push(name);
            }
        }
        names.sort();

        Ok(Self {
            dir: dir.to_path_buf(),
            backlog: backlog.max(1),
            names,
        })
    }

    /// `YYYYMMDDHHmmssffff.db` — seconds plus four digits of fraction.
    pub fn timestamp_name(now: DateTime<Utc>) -> String {
        format!(
            "{}{:04}.db",
            now.format("%Y%m%d%H%M%S"),
            now.nanosecond() / 100_000
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn temp_path(&self) -> PathBuf {
        self.dir.join(TEMP_SNAPSHOT)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn list(&self) -> &[String] {
        &self.names
    }

    /// Append a new snapshot name; returns the evicted oldest name once
    /// the backlog bound is exceeded.
    pub fn push(&mut self, name: String) -> Option<String> {
        self.names.push(name);
        if self.names.len() > self.backlog {
            Some(self.names.remove(0))
        } else {
            None
        }
    }

    /// Drop a name from the ring (consumed by a snapshot load).
    pub fn remove(&mut self, name: &str) {
        self.names.retain(|n| n != name);
    }
}
