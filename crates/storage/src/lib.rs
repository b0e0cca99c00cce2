mod error;
pub mod git;
mod repo;

pub use error::{CommandError, SyncError, WriteError};
pub use repo::{
    CommitIdentity, RepoState, RepoTarget, Synchronizer, WorkingCopy, PUSH_MAX_ATTEMPTS,
};
