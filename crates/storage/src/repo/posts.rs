use domain::Slug;
use std::fs;
use std::path::Path;
use tracing::warn;
use wax::{Glob, Program};

use super::WorkingCopy;

impl WorkingCopy {
    /// Whether a content file `<posts>/<slug>.*` exists. Always true when no
    /// posts directory is configured.
    pub fn post_exists(&self, slug: &Slug) -> bool {
        let Some(posts) = &self.posts_path else {
            return true;
        };

        let pattern = format!("{}.*", slug);
        let glob = match Glob::new(&pattern) {
            Ok(g) => g,
            Err(e) => {
                warn!("Invalid post glob '{}': {}", pattern, e);
                return false;
            }
        };

        let dir = self.root.join(posts);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list posts in {}: {}", dir.display(), e);
                return false;
            }
        };

        entries.filter_map(Result::ok).any(|entry| {
            let name = entry.file_name();
            glob.is_match(Path::new(&name))
        })
    }
}
