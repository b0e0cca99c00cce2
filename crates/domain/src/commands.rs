use crate::models::Slug;
use std::path::PathBuf;

/// Operations accepted by the publishing worker. Each one runs to completion
/// before the next is taken off the queue.
#[derive(Debug, Clone)]
pub enum RepoCommand {
    Pull,
    CommitAndPush {
        // 相对于工作副本根目录
        path: PathBuf,
        slug: Slug,
    },
}
