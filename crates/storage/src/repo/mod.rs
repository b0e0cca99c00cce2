mod comments;
mod posts;
mod sync;

pub use sync::{CommitIdentity, RepoState, RepoTarget, Synchronizer, PUSH_MAX_ATTEMPTS};

use std::path::{Path, PathBuf};

/// Filesystem view of the single checked-out clone. Writers and readers go
/// through this handle; git operations go through the [`Synchronizer`].
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    root: PathBuf,
    comments_path: PathBuf,
    posts_path: Option<PathBuf>,
}

impl WorkingCopy {
    /// `comments_path` and `posts_path` are relative to `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        comments_path: impl Into<PathBuf>,
        posts_path: Option<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            comments_path: comments_path.into(),
            posts_path,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn is_cloned(&self) -> bool {
        self.root.join(".git").exists()
    }
}
