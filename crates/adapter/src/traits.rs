use anyhow::Result;
use async_trait::async_trait;
use domain::Slug;
use std::path::PathBuf;

/// Publishes a comment file that already exists in the working copy.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, path: PathBuf, slug: Slug) -> Result<()>;
}
