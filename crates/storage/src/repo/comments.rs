use domain::CommentRecord;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::WorkingCopy;
use crate::error::WriteError;

const RECORD_EXTENSION: &str = "yml";

impl WorkingCopy {
    /// Writes `record` to `<comments>/<slug>/<timestamp>-<random>.yml` and
    /// returns that path relative to the working copy root.
    pub fn write_comment(&self, record: &CommentRecord) -> Result<PathBuf, WriteError> {
        let dir = self.comments_path.join(record.slug.as_str());
        let full_dir = self.root.join(&dir);
        fs::create_dir_all(&full_dir).map_err(|source| WriteError::CreateDir {
            path: full_dir.clone(),
            source,
        })?;

        let rel_path = dir.join(record_file_name(record));
        let data = serde_yaml::to_string(record)?;
        self.create_record_file(&rel_path, data.as_bytes())?;
        Ok(rel_path)
    }

    fn create_record_file(&self, rel_path: &Path, data: &[u8]) -> Result<(), WriteError> {
        let full_path = self.root.join(rel_path);
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(WriteError::Collision(rel_path.to_path_buf()))
            }
            Err(source) => {
                return Err(WriteError::Io {
                    path: full_path,
                    source,
                })
            }
        };
        file.write_all(data).map_err(|source| WriteError::Io {
            path: full_path,
            source,
        })
    }
}

fn record_file_name(record: &CommentRecord) -> String {
    let suffix = hex::encode(rand::random::<[u8; 4]>());
    format!(
        "{}-{}.{}",
        record.date.format("%Y%m%d%H%M%S"),
        suffix,
        RECORD_EXTENSION
    )
}
