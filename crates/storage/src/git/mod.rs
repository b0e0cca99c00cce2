//! Version-control plumbing: the backend that runs git and the SSH host
//! trust store consulted before any network operation.

mod backend;
mod trust;

pub use backend::{redact_url, GitBackend, ShellGit, SshOptions};
pub use trust::{HostKeyScanner, KnownHosts, RemoteHost, SshKeyscan};
