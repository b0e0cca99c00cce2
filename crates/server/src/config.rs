use anyhow::{bail, ensure, Context};
use config::ConfigError;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use storage::git::{redact_url, SshOptions};
use storage::{CommitIdentity, RepoTarget};
use tracing::info;
use url::Url;

use crate::guard::{origin_of, GuardConfig};

const ENV_PREFIX: &str = "GITCOMMENTS_";

#[derive(Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub repo: RepoSettings,
    pub ssh: SshSettings,
    pub guard: GuardSettings,
}

#[derive(Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

#[derive(Deserialize, Clone)]
pub struct RepoSettings {
    pub url: String,
    pub branch: String,
    pub work_dir: String,
    pub comments_path: String,
    // 为空时不校验文章是否存在
    pub posts_path: String,
    pub author_name: String,
    pub author_email: String,
}

#[derive(Deserialize, Clone)]
pub struct SshSettings {
    pub key_path: String,
    pub known_hosts_path: String,
    pub insecure: bool,
}

#[derive(Deserialize, Clone)]
pub struct GuardSettings {
    /// Comma separated, e.g. `https://example.com,https://www.example.com`.
    pub allowed_origins: String,
    pub max_body_chars: usize,
    pub honeypot_field: String,
    pub timestamp_field: String,
    pub min_submit_secs: i64,
    pub max_links: usize,
    /// Comma separated regexes, matched case-insensitively.
    pub blocked_patterns: String,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max: usize,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_env_map(collect_env_vars())
    }

    fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());
        let env_json =
            serde_json::to_string(&env_map).map_err(|e| ConfigError::Foreign(Box::new(e)))?;

        let s = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.request_timeout_secs", 60)?
            .set_default("repo.url", "")?
            .set_default("repo.branch", "main")?
            .set_default("repo.work_dir", "data/repo")?
            .set_default("repo.comments_path", "_data/comments")?
            .set_default("repo.posts_path", "")?
            .set_default("repo.author_name", "gitcomments")?
            .set_default("repo.author_email", "gitcomments@localhost")?
            .set_default("ssh.key_path", ".ssh/id_ed25519")?
            .set_default("ssh.known_hosts_path", ".ssh/known_hosts")?
            .set_default("ssh.insecure", false)?
            .set_default("guard.allowed_origins", "")?
            .set_default("guard.max_body_chars", 10_000)?
            .set_default("guard.honeypot_field", "website")?
            .set_default("guard.timestamp_field", "_timestamp")?
            .set_default("guard.min_submit_secs", 5)?
            .set_default("guard.max_links", 3)?
            .set_default("guard.blocked_patterns", "")?
            .set_default("guard.rate_limit_window_secs", 60)?
            .set_default("guard.rate_limit_max", 5)?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::File::with_name(&format!("config.{}", run_mode)).required(false))
            .add_source(config::File::from_str(&env_json, config::FileFormat::Json))
            .build()?;

        s.try_deserialize()
    }

    /// Validates the raw settings and turns them into the immutable runtime configuration.
    pub fn resolve(self) -> anyhow::Result<AppConfig> {
        let url = self.repo.url.trim().to_string();
        ensure!(!url.is_empty(), "repo.url is required");

        let comments_path = relative_repo_path("repo.comments_path", &self.repo.comments_path)?;
        let posts_path = if self.repo.posts_path.trim().is_empty() {
            None
        } else {
            Some(relative_repo_path("repo.posts_path", &self.repo.posts_path)?)
        };

        ensure!(
            self.guard.min_submit_secs >= 0,
            "guard.min_submit_secs must be a non-negative integer"
        );

        let guard = GuardConfig {
            allowed_origins: parse_origins(&self.guard.allowed_origins)?,
            max_body_chars: self.guard.max_body_chars,
            honeypot_field: self.guard.honeypot_field.trim().to_string(),
            timestamp_field: self.guard.timestamp_field.trim().to_string(),
            min_submit_secs: self.guard.min_submit_secs,
            max_links: self.guard.max_links,
            blocked_patterns: parse_patterns(&self.guard.blocked_patterns)?,
        };

        Ok(AppConfig {
            server: self.server,
            repo: RepoConfig {
                url,
                branch: self.repo.branch,
                work_dir: absolutize(&self.repo.work_dir)?,
                comments_path,
                posts_path,
                identity: CommitIdentity {
                    name: self.repo.author_name,
                    email: self.repo.author_email,
                },
            },
            ssh: SshOptions {
                key_path: absolutize(&self.ssh.key_path)?,
                known_hosts_path: absolutize(&self.ssh.known_hosts_path)?,
                insecure: self.ssh.insecure,
            },
            guard,
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(self.guard.rate_limit_window_secs),
                max: self.guard.rate_limit_max,
            },
        })
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub struct AppConfig {
    pub server: ServerSettings,
    pub repo: RepoConfig,
    pub ssh: SshOptions,
    pub guard: GuardConfig,
    pub rate_limit: RateLimitConfig,
}

pub struct RepoConfig {
    pub url: String,
    pub branch: String,
    pub work_dir: PathBuf,
    pub comments_path: PathBuf,
    pub posts_path: Option<PathBuf>,
    pub identity: CommitIdentity,
}

pub struct RateLimitConfig {
    pub window: Duration,
    pub max: usize,
}

impl AppConfig {
    pub fn repo_target(&self) -> RepoTarget {
        RepoTarget {
            url: self.repo.url.clone(),
            branch: self.repo.branch.clone(),
            strict_host_keys: !self.ssh.insecure,
        }
    }

    pub fn log_summary(&self) {
        info!(
            "Repo: {} (branch: {})",
            redact_url(&self.repo.url),
            self.repo.branch
        );
        info!("Working copy: {}", self.repo.work_dir.display());
        info!("Comments path: {}", self.repo.comments_path.display());
        if let Some(ref posts) = self.repo.posts_path {
            info!(
                "Posts path: {} (post existence validation enabled)",
                posts.display()
            );
        }
        info!("Allowed origins: {:?}", self.guard.allowed_origins);
        if self.ssh.insecure {
            info!("SSH host key checking disabled");
        }
        if !self.guard.honeypot_field.is_empty() {
            info!("Honeypot field: {}", self.guard.honeypot_field);
        }
        if self.rate_limit.max > 0 {
            info!(
                "Rate limit: {} requests per {}s",
                self.rate_limit.max,
                self.rate_limit.window.as_secs()
            );
        }
        if self.guard.max_links > 0 {
            info!("Max links: {}", self.guard.max_links);
        }
        if !self.guard.blocked_patterns.is_empty() {
            info!("Blocked patterns: {}", self.guard.blocked_patterns.len());
        }
        if self.guard.min_submit_secs > 0 {
            info!("Min submit time: {}s", self.guard.min_submit_secs);
        }
    }
}

fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter_map(|(k, v)| env_key_to_path(&k).map(|key| (key, v)))
        .collect()
}

/// `GITCOMMENTS_REPO__URL` -> `repo.url`
fn env_key_to_path(key: &str) -> Option<String> {
    key.strip_prefix(ENV_PREFIX)
        .map(|rest| rest.replace("__", ".").to_lowercase())
}

/// Cleans a path that must stay inside the working copy.
fn relative_repo_path(key: &str, raw: &str) -> anyhow::Result<PathBuf> {
    let path = Path::new(raw.trim());
    ensure!(!path.is_absolute(), "{} must be a relative path", key);

    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    bail!("{} must not escape the repo directory", key);
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("{} must be a relative path", key)
            }
        }
    }
    Ok(clean)
}

fn parse_origins(raw: &str) -> anyhow::Result<Vec<String>> {
    let mut origins = Vec::new();
    for origin in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parsed = Url::parse(origin)
            .ok()
            .filter(|u| !u.scheme().is_empty() && u.host_str().is_some());
        let Some(url) = parsed else {
            bail!(
                "guard.allowed_origins: invalid origin {:?} (must include scheme and host, e.g. https://example.com)",
                origin
            );
        };
        // 与请求侧比较时的形式一致：主机小写，省略默认端口
        origins.push(origin_of(&url));
    }
    ensure!(
        !origins.is_empty(),
        "guard.allowed_origins must contain at least one origin"
    );
    Ok(origins)
}

fn parse_patterns(raw: &str) -> anyhow::Result<Vec<Regex>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|p| {
            Regex::new(&format!("(?i){}", p))
                .with_context(|| format!("guard.blocked_patterns: invalid regex {:?}", p))
        })
        .collect()
}

fn absolutize(raw: &str) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}
