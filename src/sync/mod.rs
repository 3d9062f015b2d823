//! Local-authoritative workspace mirroring.
//!
//! One sync converges the remote tree to the local tree: the local pass
//! uploads anything missing or newer and records every path it keeps,
//! then the remote pass deletes whatever the local pass did not claim.
//! Change detection compares modification times rather than content,
//! trading correctness under clock skew for speed on large trees; the
//! remote tree is never edited independently of this tool, so a
//! one-directional mirror needs no conflict resolution.

use std::collections::HashSet;
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

mod session;
mod target;

pub use session::{ConnectSettings, FileTransfer, SftpSession};
pub use target::{EXCLUDED_DIRS, RemoteEntry, SyncTarget};

/// Aggregated result of one sync call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChangeSet {
    /// Files transferred because the remote copy was missing.
    pub added: u64,
    /// Files transferred because the local copy was newer.
    pub updated: u64,
    /// Stale remote files and directories removed.
    pub deleted: u64,
    /// Wall time of the whole sync.
    pub elapsed: Duration,
}

impl ChangeSet {
    /// Returns `true` when the sync applied no remote mutation.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Errors surfaced while mirroring; any of them aborts the whole sync.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    /// Raised once the dial retry budget is spent.
    #[error("failed to connect to the forwarded endpoint after {attempts} attempts: {message}")]
    ConnectExhausted {
        /// Attempts that were made.
        attempts: u32,
        /// Last dial error observed.
        message: String,
    },
    /// Raised when the local root does not exist.
    #[error("sync source directory missing: {path}")]
    MissingSource {
        /// Path that was expected to be mirrored.
        path: Utf8PathBuf,
    },
    /// Raised when a local filesystem operation fails.
    #[error("local filesystem error at {path}: {message}")]
    LocalIo {
        /// Path the operation touched.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a remote filesystem operation fails.
    #[error("remote {operation} failed for {path}: {message}")]
    RemoteIo {
        /// Operation that failed.
        operation: String,
        /// Path the operation touched.
        path: Utf8PathBuf,
        /// Server error string.
        message: String,
    },
    /// Raised when a path cannot be represented as UTF-8.
    #[error("path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// Lossy rendering of the offending path.
        path: String,
    },
}

/// Mirrors one [`SyncTarget`] through an established [`FileTransfer`]
/// session.
#[derive(Debug)]
pub struct Mirror<'a, T: FileTransfer> {
    target: &'a SyncTarget,
    transfer: &'a T,
}

impl<'a, T: FileTransfer> Mirror<'a, T> {
    /// Creates a mirror over an established session.
    #[must_use]
    pub const fn new(target: &'a SyncTarget, transfer: &'a T) -> Self {
        Self { target, transfer }
    }

    /// Converges the remote tree to the local tree and reports the changes.
    ///
    /// On error the accumulated counts are discarded; partially applied
    /// remote state is converged again by the next invocation since local
    /// stays authoritative for everything it still has.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingSource`] when the local root is absent
    /// and [`SyncError::LocalIo`] / [`SyncError::RemoteIo`] for filesystem
    /// failures on either side.
    pub fn run(&self) -> Result<ChangeSet, SyncError> {
        let started = Instant::now();
        if !self.target.local_root.is_dir() {
            return Err(SyncError::MissingSource {
                path: self.target.local_root.clone(),
            });
        }

        let mut counts = ChangeSet::default();
        let mut known: HashSet<Utf8PathBuf> = HashSet::new();
        self.transfer.ensure_dir(&self.target.remote_root)?;
        self.local_pass(Utf8Path::new(""), &mut known, &mut counts)?;
        self.remote_pass(&known, &mut counts)?;
        counts.elapsed = started.elapsed();
        Ok(counts)
    }

    /// Walks the local tree depth-first, uploading what the remote side is
    /// missing and recording every kept path.
    fn local_pass(
        &self,
        relative: &Utf8Path,
        known: &mut HashSet<Utf8PathBuf>,
        counts: &mut ChangeSet,
    ) -> Result<(), SyncError> {
        let local_dir = self.target.local_root.join(relative);
        for (name, file_type) in sorted_entries(&local_dir)? {
            let entry_path = relative.join(&name);
            if file_type.is_dir() {
                if self.target.excludes(&name) {
                    continue;
                }
                self.transfer
                    .ensure_dir(&self.target.remote_root.join(&entry_path))?;
                known.insert(entry_path.clone());
                self.local_pass(&entry_path, known, counts)?;
            } else if file_type.is_file() {
                known.insert(entry_path.clone());
                self.sync_file(&local_dir.join(&name), &entry_path, counts)?;
            }
            // Symlinks and special files are not mirrored.
        }
        Ok(())
    }

    /// Transfers one file when the remote copy is missing or older.
    fn sync_file(
        &self,
        local: &Utf8Path,
        relative: &Utf8Path,
        counts: &mut ChangeSet,
    ) -> Result<(), SyncError> {
        let remote = self.target.remote_root.join(relative);
        let local_modified = fs::metadata(local)
            .and_then(|meta| meta.modified())
            .map_err(|err| SyncError::LocalIo {
                path: local.to_owned(),
                message: err.to_string(),
            })?;

        match self.transfer.modified(&remote)? {
            None => {
                self.transfer.upload(local, &remote)?;
                counts.added += 1;
            }
            Some(remote_modified) if local_modified > remote_modified => {
                self.transfer.upload(local, &remote)?;
                counts.updated += 1;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Deletes every remote entry the local pass did not claim. Files go
    /// immediately; directories are deferred and removed in reverse
    /// discovery order so no non-empty directory is ever deleted.
    fn remote_pass(
        &self,
        known: &HashSet<Utf8PathBuf>,
        counts: &mut ChangeSet,
    ) -> Result<(), SyncError> {
        let entries = self.transfer.walk(&self.target.remote_root)?;
        let mut stale_dirs: Vec<Utf8PathBuf> = Vec::new();
        for entry in &entries {
            if known.contains(&entry.path) {
                continue;
            }
            if entry.is_dir {
                stale_dirs.push(entry.path.clone());
            } else {
                self.transfer
                    .remove_file(&self.target.remote_root.join(&entry.path))?;
                counts.deleted += 1;
            }
        }
        for dir in stale_dirs.iter().rev() {
            self.transfer
                .remove_dir(&self.target.remote_root.join(dir))?;
            counts.deleted += 1;
        }
        Ok(())
    }
}

/// Lists a local directory sorted by name so transfer order is stable.
fn sorted_entries(dir: &Utf8Path) -> Result<Vec<(String, fs::FileType)>, SyncError> {
    let local_error = |message: String| SyncError::LocalIo {
        path: dir.to_owned(),
        message,
    };

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| local_error(err.to_string()))? {
        let entry = entry.map_err(|err| local_error(err.to_string()))?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| SyncError::NonUtf8Path {
                path: name.to_string_lossy().into_owned(),
            })?;
        let file_type = entry
            .file_type()
            .map_err(|err| local_error(err.to_string()))?;
        entries.push((name, file_type));
    }
    entries.sort_by(|left, right| left.0.cmp(&right.0));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::ChangeSet;

    #[test]
    fn changeset_is_empty_only_when_all_counters_are_zero() {
        assert!(ChangeSet::default().is_empty());
        assert!(
            !ChangeSet {
                deleted: 1,
                ..ChangeSet::default()
            }
            .is_empty()
        );
    }
}
