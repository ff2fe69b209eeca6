//! Store abstraction for custodes state.
//!
//! A store is one directory holding the SQLite database, the broker audit log,
//! and the default config file. Two kinds exist: a per-user store and a store
//! scoped to the repository the personas work on.

use std::path::{Path, PathBuf};

/// Store type discriminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// User store at `~/.custodes/`
    User,
    /// Repo store at `<repo>/.custodes/`
    Repo,
}

/// Store handle representing a custodes state directory.
///
/// All persona metrics, proposals, test history and learning events are
/// scoped to a store.
#[derive(Debug, Clone)]
pub struct Store {
    /// Store type (User or Repo)
    pub kind: StoreKind,
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(kind: StoreKind, root: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: root.into(),
        }
    }

    /// Resolve the store root: an explicit path wins, then `<cwd>/.custodes`
    /// if it already exists, then `~/.custodes`.
    pub fn resolve(explicit: Option<&Path>, cwd: &Path) -> Self {
        if let Some(p) = explicit {
            return Self::new(StoreKind::Repo, p);
        }
        let repo_root = cwd.join(".custodes");
        if repo_root.is_dir() {
            return Self::new(StoreKind::Repo, repo_root);
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.to_path_buf());
        Self::new(StoreKind::User, home.join(".custodes"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("custodes.toml")
    }
}
