mod commands;
mod models;

pub use commands::RepoCommand;
pub use models::{CommentRecord, Slug, SlugError, Submission};
