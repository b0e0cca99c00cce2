use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use url::Url;

use super::backend::run_command;
use crate::error::{CommandError, SyncError};

/// The host a remote URL points at, with its SSH port when one is spelled out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub name: String,
    pub port: Option<u16>,
}

impl RemoteHost {
    /// Accepts scp-like `user@host:path` remotes as well as `scheme://host/path` URLs.
    pub fn from_remote_url(remote: &str) -> Option<Self> {
        if remote.contains('@') && remote.contains(':') && !remote.contains("://") {
            let (_, rest) = remote.split_once('@')?;
            let (host, _) = rest.split_once(':')?;
            if host.is_empty() {
                return None;
            }
            return Some(Self {
                name: host.to_string(),
                port: None,
            });
        }

        let url = Url::parse(remote).ok()?;
        let name = url.host_str().filter(|h| !h.is_empty())?.to_string();
        Some(Self {
            name,
            port: url.port(),
        })
    }

    pub fn known_hosts_key(&self) -> String {
        match self.port {
            Some(port) if port != 22 => format!("[{}]:{}", self.name, port),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    // 文件不存在时视为空
    pub fn load(&self) -> Result<String, SyncError> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    pub fn contains(&self, host: &RemoteHost) -> Result<bool, SyncError> {
        let key = host.known_hosts_key();
        let with_space = format!("{} ", key);
        let with_comma = format!("{},", key);
        Ok(self
            .load()?
            .lines()
            .any(|line| line.starts_with(&with_space) || line.starts_with(&with_comma)))
    }

    pub fn append(&self, entries: &[u8]) -> Result<(), SyncError> {
        self.ensure_parent()?;
        let mut file = open_options()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(entries).map_err(|e| self.io_error(e))
    }

    /// Replaces the whole file so stale keys never sit beside fresh ones.
    pub fn overwrite(&self, entries: &[u8]) -> Result<(), SyncError> {
        self.ensure_parent()?;
        let mut file = open_options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(entries).map_err(|e| self.io_error(e))
    }

    fn ensure_parent(&self) -> Result<(), SyncError> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        if parent.as_os_str().is_empty() || parent.exists() {
            return Ok(());
        }
        create_private_dir(parent).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> SyncError {
        SyncError::TrustStore {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn open_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut opts = OpenOptions::new();
    opts.mode(0o600);
    opts
}

#[cfg(not(unix))]
fn open_options() -> OpenOptions {
    OpenOptions::new()
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Fetches the public host keys a server presents, in known_hosts format.
#[async_trait]
pub trait HostKeyScanner: Send + Sync {
    async fn scan(&self, host: &RemoteHost) -> Result<Vec<u8>, CommandError>;
}

#[derive(Debug, Clone, Default)]
pub struct SshKeyscan;

#[async_trait]
impl HostKeyScanner for SshKeyscan {
    async fn scan(&self, host: &RemoteHost) -> Result<Vec<u8>, CommandError> {
        let port = host.port.map(|p| p.to_string());
        let mut args: Vec<&str> = Vec::new();
        if let Some(ref p) = port {
            args.extend(["-p", p.as_str()]);
        }
        args.push(&host.name);
        let keys = run_command("ssh-keyscan", &args, Path::new("."), &[]).await?;
        // ssh-keyscan exits 0 even when it reached nothing
        if keys.iter().all(u8::is_ascii_whitespace) {
            return Err(CommandError::Failed {
                command: format!("ssh-keyscan {}", args.join(" ")),
                code: Some(0),
                stderr: "no host keys returned".to_string(),
            });
        }
        Ok(keys)
    }
}
