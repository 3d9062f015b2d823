//! Sync target description and exclusion rules.

use std::time::SystemTime;

use camino::Utf8PathBuf;

/// Directory base names that are never mirrored, at any depth.
pub const EXCLUDED_DIRS: [&str; 9] = [
    ".git",
    ".github",
    ".vs",
    ".angular",
    "bin",
    "obj",
    "node_modules",
    "k8s",
    "docs",
];

/// The local/remote directory pair and exclusion rules for one sync call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncTarget {
    /// Root of the local project tree; authoritative for the mirror.
    pub local_root: Utf8PathBuf,
    /// Remote directory receiving the mirror, relative to the session root.
    pub remote_root: Utf8PathBuf,
    /// Front-end directory name excluded when `skip_ui` is set.
    pub ui_dir: String,
    /// Whether the front-end subtree is left out of this sync.
    pub skip_ui: bool,
}

impl SyncTarget {
    /// Builds a target for one invocation.
    #[must_use]
    pub fn new(
        local_root: Utf8PathBuf,
        remote_root: Utf8PathBuf,
        ui_dir: impl Into<String>,
        skip_ui: bool,
    ) -> Self {
        Self {
            local_root,
            remote_root,
            ui_dir: ui_dir.into(),
            skip_ui,
        }
    }

    /// Returns `true` when a directory with this base name is pruned.
    #[must_use]
    pub fn excludes(&self, dir_name: &str) -> bool {
        EXCLUDED_DIRS.contains(&dir_name) || (self.skip_ui && dir_name == self.ui_dir)
    }
}

/// One entry observed while walking the remote tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteEntry {
    /// Path relative to the walk root, slash-normalised.
    pub path: Utf8PathBuf,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Modification time when the server reports one.
    pub modified: Option<SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(skip_ui: bool) -> SyncTarget {
        SyncTarget::new(
            Utf8PathBuf::from("/src/shop"),
            Utf8PathBuf::from("workspace/shop"),
            "web",
            skip_ui,
        )
    }

    #[test]
    fn fixed_deny_list_is_excluded() {
        let rules = target(false);

        for name in EXCLUDED_DIRS {
            assert!(rules.excludes(name), "{name} should be excluded");
        }
        assert!(!rules.excludes("src"));
    }

    #[test]
    fn ui_dir_is_excluded_only_under_the_skip_flag() {
        assert!(!target(false).excludes("web"));
        assert!(target(true).excludes("web"));
    }
}
