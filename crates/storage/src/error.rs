use std::path::PathBuf;

/// A subprocess that could not be started or exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("working copy has not been cloned yet")]
    NotCloned,
    #[error("could not extract a host from repo url {0}")]
    UnresolvableHost(String),
    #[error("host key scan failed: {0}")]
    KeyScan(#[source] CommandError),
    #[error("host trust store {path}: {source}")]
    TrustStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("preparing working copy directory: {0}")]
    WorkDir(#[source] std::io::Error),
    #[error("git clone: {0}")]
    Clone(#[source] CommandError),
    #[error("git config: {0}")]
    Identity(#[source] CommandError),
    #[error("git pull: {0}")]
    Pull(#[source] CommandError),
    #[error("git add: {0}")]
    Add(#[source] CommandError),
    #[error("git commit: {0}")]
    Commit(#[source] CommandError),
    #[error("git pull during push retry: {0}")]
    RetryPull(#[source] CommandError),
    #[error("git push failed after {attempts} attempts: {last}")]
    PushExhausted {
        attempts: usize,
        #[source]
        last: CommandError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("creating comment directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing comment: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("comment file {0} already exists")]
    Collision(PathBuf),
    #[error("writing comment file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
