use domain::Slug;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::WorkingCopy;
use crate::error::SyncError;
use crate::git::{redact_url, GitBackend, HostKeyScanner, KnownHosts, RemoteHost};

pub const PUSH_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Uninitialized,
    Cloned,
    Synced,
}

#[derive(Debug, Clone)]
pub struct RepoTarget {
    pub url: String,
    pub branch: String,
    pub strict_host_keys: bool,
}

#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

// 所有操作都取 &mut self：持有者即唯一可以操作工作区的一方
pub struct Synchronizer<B, K> {
    backend: B,
    scanner: K,
    known_hosts: KnownHosts,
    target: RepoTarget,
    identity: CommitIdentity,
    working_copy: WorkingCopy,
    state: RepoState,
}

impl<B: GitBackend, K: HostKeyScanner> Synchronizer<B, K> {
    pub fn new(
        backend: B,
        scanner: K,
        known_hosts: KnownHosts,
        target: RepoTarget,
        identity: CommitIdentity,
        working_copy: WorkingCopy,
    ) -> Self {
        Self {
            backend,
            scanner,
            known_hosts,
            target,
            identity,
            working_copy,
            state: RepoState::Uninitialized,
        }
    }

    pub fn state(&self) -> RepoState {
        self.state
    }

    pub async fn ensure_host_keys(&self) -> Result<(), SyncError> {
        if !self.target.strict_host_keys {
            return Ok(());
        }
        let host = self.remote_host()?;
        if self.known_hosts.contains(&host)? {
            info!("Host key for {} already trusted", host.known_hosts_key());
            return Ok(());
        }
        info!(
            "Host key for {} not found, scanning",
            host.known_hosts_key()
        );
        let keys = self.scanner.scan(&host).await.map_err(SyncError::KeyScan)?;
        self.known_hosts.append(&keys)
    }

    pub async fn refresh_host_keys(&self) -> Result<(), SyncError> {
        let host = self.remote_host()?;
        info!("Refreshing SSH host keys for {}", host.known_hosts_key());
        let keys = self.scanner.scan(&host).await.map_err(SyncError::KeyScan)?;
        self.known_hosts.overwrite(&keys)
    }

    fn remote_host(&self) -> Result<RemoteHost, SyncError> {
        RemoteHost::from_remote_url(&self.target.url)
            .ok_or_else(|| SyncError::UnresolvableHost(redact_url(&self.target.url)))
    }

    pub async fn clone_or_pull(&mut self) -> Result<(), SyncError> {
        if let Err(e) = self.ensure_host_keys().await {
            warn!("Could not ensure host keys: {}", e);
        }

        if self.working_copy.is_cloned() {
            info!("Working copy already cloned, pulling instead");
            self.transition(RepoState::Cloned);
            return self.pull_locked().await;
        }

        let root = self.working_copy.root().to_path_buf();
        fs::create_dir_all(&root).map_err(SyncError::WorkDir)?;

        if let Err(e) = self.clone_into(&root).await {
            if !self.target.strict_host_keys {
                return Err(e);
            }
            warn!("git clone failed ({}), refreshing SSH host keys and retrying", e);
            if let Err(scan_err) = self.refresh_host_keys().await {
                warn!("Host key refresh failed: {}", scan_err);
                return Err(e);
            }
            fs::remove_dir_all(&root).map_err(SyncError::WorkDir)?;
            fs::create_dir_all(&root).map_err(SyncError::WorkDir)?;
            self.clone_into(&root).await?;
        }

        self.backend
            .set_config(&root, "user.email", &self.identity.email)
            .await
            .map_err(SyncError::Identity)?;
        self.backend
            .set_config(&root, "user.name", &self.identity.name)
            .await
            .map_err(SyncError::Identity)?;

        self.transition(RepoState::Cloned);
        info!(
            "Cloned {} ({}) into {}",
            redact_url(&self.target.url),
            self.target.branch,
            root.display()
        );
        Ok(())
    }

    async fn clone_into(&self, root: &Path) -> Result<(), SyncError> {
        self.backend
            .clone_branch(&self.target.url, &self.target.branch, root)
            .await
            .map_err(SyncError::Clone)
    }

    pub async fn pull(&mut self) -> Result<(), SyncError> {
        self.require_clone()?;
        self.pull_locked().await
    }

    async fn pull_locked(&mut self) -> Result<(), SyncError> {
        self.backend
            .pull_rebase(self.working_copy.root(), &self.target.branch)
            .await
            .map_err(SyncError::Pull)?;
        self.transition(RepoState::Synced);
        Ok(())
    }

    /// Commits and pushes the record at `path`. The whole comments directory
    /// is staged, so records stranded by an earlier failed publish go out too.
    /// Rejected pushes are rebased and retried up to [`PUSH_MAX_ATTEMPTS`] times.
    pub async fn commit_and_push(&mut self, path: &Path, slug: &Slug) -> Result<(), SyncError> {
        self.require_clone()?;
        let root = self.working_copy.root().to_path_buf();
        debug!("Publishing {}", path.display());

        self.pull_locked().await?;
        self.backend
            .add(&root, &self.working_copy.comments_path)
            .await
            .map_err(SyncError::Add)?;
        self.backend
            .commit(&root, &format!("Add comment on {}", slug))
            .await
            .map_err(SyncError::Commit)?;
        self.transition(RepoState::Cloned);

        let mut attempt = 1;
        loop {
            let pushed = self.backend.push(&root, &self.target.branch).await;
            let err = match pushed {
                Ok(()) => {
                    self.transition(RepoState::Synced);
                    return Ok(());
                }
                Err(e) => e,
            };

            if attempt >= PUSH_MAX_ATTEMPTS {
                return Err(SyncError::PushExhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            warn!(
                "git push attempt {} failed: {}, retrying after pull --rebase",
                attempt, err
            );

            if let Err(pull_err) = self
                .backend
                .pull_rebase(&root, &self.target.branch)
                .await
            {
                if let Err(abort_err) = self.backend.rebase_abort(&root).await {
                    warn!("git rebase --abort failed: {}", abort_err);
                }
                return Err(SyncError::RetryPull(pull_err));
            }
            attempt += 1;
        }
    }

    fn transition(&mut self, next: RepoState) {
        if self.state != next {
            debug!("Repository state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn require_clone(&self) -> Result<(), SyncError> {
        match self.state {
            RepoState::Uninitialized => Err(SyncError::NotCloned),
            RepoState::Cloned | RepoState::Synced => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use domain::CommentRecord;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Clone,
        Pull,
        Add(PathBuf),
        Commit(String),
        Push,
        Abort,
        Config(String, String),
    }

    // clone/pull/push 的结果按脚本返回，其余操作一律成功
    #[derive(Clone, Default)]
    struct ScriptedGit {
        calls: Arc<Mutex<Vec<Call>>>,
        clone_results: Arc<Mutex<VecDeque<bool>>>,
        pull_results: Arc<Mutex<VecDeque<bool>>>,
        push_results: Arc<Mutex<VecDeque<bool>>>,
    }

    impl ScriptedGit {
        fn clones(self, results: &[bool]) -> Self {
            *self.clone_results.lock().unwrap() = results.iter().copied().collect();
            self
        }

        fn pulls(self, results: &[bool]) -> Self {
            *self.pull_results.lock().unwrap() = results.iter().copied().collect();
            self
        }

        fn pushes(self, results: &[bool]) -> Self {
            *self.push_results.lock().unwrap() = results.iter().copied().collect();
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, wanted: &Call) -> usize {
            self.calls().iter().filter(|c| *c == wanted).count()
        }

        fn record(&self, call: Call, script: &Mutex<VecDeque<bool>>) -> Result<(), CommandError> {
            let command = format!("{:?}", call);
            self.calls.lock().unwrap().push(call);
            if script.lock().unwrap().pop_front().unwrap_or(true) {
                Ok(())
            } else {
                Err(CommandError::Failed {
                    command,
                    code: Some(1),
                    stderr: "rejected".into(),
                })
            }
        }
    }

    #[async_trait]
    impl GitBackend for ScriptedGit {
        async fn clone_branch(&self, _: &str, _: &str, dest: &Path) -> Result<(), CommandError> {
            let result = self.record(Call::Clone, &self.clone_results);
            if result.is_ok() {
                fs::create_dir_all(dest.join(".git")).unwrap();
            }
            result
        }

        async fn pull_rebase(&self, _: &Path, _: &str) -> Result<(), CommandError> {
            self.record(Call::Pull, &self.pull_results)
        }

        async fn add(&self, _: &Path, path: &Path) -> Result<(), CommandError> {
            self.calls.lock().unwrap().push(Call::Add(path.to_path_buf()));
            Ok(())
        }

        async fn commit(&self, _: &Path, message: &str) -> Result<(), CommandError> {
            self.calls.lock().unwrap().push(Call::Commit(message.to_string()));
            Ok(())
        }

        async fn push(&self, _: &Path, _: &str) -> Result<(), CommandError> {
            self.record(Call::Push, &self.push_results)
        }

        async fn rebase_abort(&self, _: &Path) -> Result<(), CommandError> {
            self.calls.lock().unwrap().push(Call::Abort);
            Ok(())
        }

        async fn set_config(&self, _: &Path, key: &str, value: &str) -> Result<(), CommandError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Config(key.to_string(), value.to_string()));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeScanner {
        scans: Arc<Mutex<usize>>,
    }

    impl FakeScanner {
        fn scans(&self) -> usize {
            *self.scans.lock().unwrap()
        }
    }

    #[async_trait]
    impl HostKeyScanner for FakeScanner {
        async fn scan(&self, host: &RemoteHost) -> Result<Vec<u8>, CommandError> {
            let mut n = self.scans.lock().unwrap();
            *n += 1;
            Ok(format!("{} ssh-ed25519 KEY{}\n", host.known_hosts_key(), *n).into_bytes())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        git: ScriptedGit,
        scanner: FakeScanner,
        known_hosts: KnownHosts,
        sync: Synchronizer<ScriptedGit, FakeScanner>,
    }

    fn fixture(git: ScriptedGit, strict: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scanner = FakeScanner::default();
        let known_hosts = KnownHosts::new(dir.path().join("ssh/known_hosts"));
        let sync = Synchronizer::new(
            git.clone(),
            scanner.clone(),
            known_hosts.clone(),
            RepoTarget {
                url: "git@git.example.com:me/site.git".into(),
                branch: "main".into(),
                strict_host_keys: strict,
            },
            CommitIdentity {
                name: "gitcomments".into(),
                email: "bot@example.com".into(),
            },
            WorkingCopy::new(dir.path().join("repo"), "comments", None),
        );
        Fixture {
            _dir: dir,
            git,
            scanner,
            known_hosts,
            sync,
        }
    }

    async fn cloned(git: ScriptedGit) -> Fixture {
        let mut f = fixture(git, false);
        f.sync.clone_or_pull().await.unwrap();
        f.git.calls.lock().unwrap().clear();
        f
    }

    fn slug() -> Slug {
        Slug::new("my-post").unwrap()
    }

    #[tokio::test]
    async fn fresh_clone_trusts_host_and_sets_identity() {
        let mut f = fixture(ScriptedGit::default(), true);

        f.sync.clone_or_pull().await.unwrap();

        assert_eq!(f.sync.state(), RepoState::Cloned);
        assert_eq!(f.scanner.scans(), 1);
        assert!(f.known_hosts.load().unwrap().starts_with("git.example.com "));
        assert_eq!(
            f.git.calls(),
            vec![
                Call::Clone,
                Call::Config("user.email".into(), "bot@example.com".into()),
                Call::Config("user.name".into(), "gitcomments".into()),
            ]
        );
    }

    #[tokio::test]
    async fn known_host_is_not_rescanned() {
        let f = fixture(ScriptedGit::default(), true);
        f.known_hosts
            .append(b"git.example.com ssh-ed25519 EXISTING\n")
            .unwrap();

        f.sync.ensure_host_keys().await.unwrap();

        assert_eq!(f.scanner.scans(), 0);
    }

    #[tokio::test]
    async fn insecure_mode_never_touches_trust_store() {
        let mut f = fixture(ScriptedGit::default(), false);
        f.sync.clone_or_pull().await.unwrap();
        assert_eq!(f.scanner.scans(), 0);
        assert_eq!(f.known_hosts.load().unwrap(), "");
    }

    #[tokio::test]
    async fn existing_working_copy_is_pulled_not_cloned() {
        let mut f = fixture(ScriptedGit::default(), false);
        fs::create_dir_all(f.sync.working_copy.root().join(".git")).unwrap();

        f.sync.clone_or_pull().await.unwrap();

        assert_eq!(f.git.calls(), vec![Call::Pull]);
        assert_eq!(f.sync.state(), RepoState::Synced);
    }

    #[tokio::test]
    async fn failed_clone_refreshes_keys_and_retries_once() {
        let mut f = fixture(ScriptedGit::default().clones(&[false, true]), true);
        f.known_hosts
            .append(b"git.example.com ssh-ed25519 STALE\n")
            .unwrap();
        fs::create_dir_all(f.sync.working_copy.root()).unwrap();
        fs::write(f.sync.working_copy.root().join("partial"), "x").unwrap();

        f.sync.clone_or_pull().await.unwrap();

        assert_eq!(f.git.count(&Call::Clone), 2);
        assert_eq!(f.scanner.scans(), 1);
        let store = f.known_hosts.load().unwrap();
        assert!(!store.contains("STALE"), "{store}");
        assert_eq!(store.lines().count(), 1);
        assert!(!f.sync.working_copy.root().join("partial").exists());
        assert_eq!(f.sync.state(), RepoState::Cloned);
    }

    #[tokio::test]
    async fn second_clone_failure_is_fatal() {
        let mut f = fixture(ScriptedGit::default().clones(&[false, false]), true);

        let err = f.sync.clone_or_pull().await.unwrap_err();

        assert!(matches!(err, SyncError::Clone(_)));
        assert_eq!(f.git.count(&Call::Clone), 2);
        assert_eq!(f.sync.state(), RepoState::Uninitialized);
    }

    #[tokio::test]
    async fn insecure_clone_failure_is_not_retried() {
        let mut f = fixture(ScriptedGit::default().clones(&[false, true]), false);

        assert!(f.sync.clone_or_pull().await.is_err());
        assert_eq!(f.git.count(&Call::Clone), 1);
    }

    #[tokio::test]
    async fn operations_require_a_clone() {
        let mut f = fixture(ScriptedGit::default(), false);
        assert!(matches!(f.sync.pull().await, Err(SyncError::NotCloned)));
        assert!(matches!(
            f.sync.commit_and_push(Path::new("x.yml"), &slug()).await,
            Err(SyncError::NotCloned)
        ));
        assert!(f.git.calls().is_empty());
    }

    #[tokio::test]
    async fn commit_and_push_happy_path() {
        let mut f = cloned(ScriptedGit::default()).await;
        let path = Path::new("comments/my-post/20240101000000-abcd1234.yml");

        f.sync.commit_and_push(path, &slug()).await.unwrap();

        assert_eq!(
            f.git.calls(),
            vec![
                Call::Pull,
                Call::Add(PathBuf::from("comments")),
                Call::Commit("Add comment on my-post".into()),
                Call::Push,
            ]
        );
        assert_eq!(f.sync.state(), RepoState::Synced);
    }

    #[tokio::test]
    async fn push_succeeding_on_second_attempt_stops_retrying() {
        let mut f = cloned(ScriptedGit::default().pushes(&[false, true, false])).await;

        f.sync
            .commit_and_push(Path::new("c.yml"), &slug())
            .await
            .unwrap();

        assert_eq!(f.git.count(&Call::Push), 2);
        // one pull before the commit, one between the two pushes
        assert_eq!(f.git.count(&Call::Pull), 2);
        assert_eq!(f.git.calls().last(), Some(&Call::Push));
    }

    #[tokio::test]
    async fn push_gives_up_after_ceiling() {
        let mut f = cloned(ScriptedGit::default().pushes(&[false; 5])).await;

        let err = f
            .sync
            .commit_and_push(Path::new("c.yml"), &slug())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::PushExhausted {
                attempts: PUSH_MAX_ATTEMPTS,
                ..
            }
        ));
        assert_eq!(f.git.count(&Call::Push), PUSH_MAX_ATTEMPTS);
        assert_eq!(f.git.count(&Call::Abort), 0);
    }

    #[tokio::test]
    async fn failed_rebase_during_retry_is_aborted_and_terminal() {
        // pull before commit succeeds, pull after the first rejected push fails
        let mut f = cloned(
            ScriptedGit::default()
                .pulls(&[true, false])
                .pushes(&[false, true]),
        )
        .await;

        let err = f
            .sync
            .commit_and_push(Path::new("c.yml"), &slug())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::RetryPull(_)));
        assert_eq!(f.git.count(&Call::Push), 1);
        assert_eq!(f.git.calls().last(), Some(&Call::Abort));
    }

    #[tokio::test]
    async fn pull_failure_before_commit_is_surfaced() {
        let mut f = cloned(ScriptedGit::default().pulls(&[false])).await;

        let err = f
            .sync
            .commit_and_push(Path::new("c.yml"), &slug())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Pull(_)));
        assert_eq!(f.git.calls(), vec![Call::Pull]);
    }

    #[tokio::test]
    async fn record_stranded_by_failed_publish_goes_out_with_the_next() {
        let mut f = cloned(ScriptedGit::default().pulls(&[false, true, true])).await;
        let record = |slug: &str| CommentRecord {
            name: "Ferris".into(),
            email: None,
            body: "hi".into(),
            date: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            slug: Slug::new(slug).unwrap(),
            reply_to: None,
        };

        let first = f.sync.working_copy.write_comment(&record("my-post")).unwrap();
        assert!(f.sync.commit_and_push(&first, &slug()).await.is_err());
        assert_eq!(f.git.count(&Call::Add(PathBuf::from("comments"))), 0);

        let second = f.sync.working_copy.write_comment(&record("other")).unwrap();
        f.sync
            .commit_and_push(&second, &Slug::new("other").unwrap())
            .await
            .unwrap();

        let staged: Vec<PathBuf> = f
            .git
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Add(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(staged, vec![PathBuf::from("comments")]);
        assert!(first.starts_with(&staged[0]));
        assert!(second.starts_with(&staged[0]));
        assert!(f.sync.working_copy.root().join(&first).exists());
    }

    #[tokio::test]
    async fn unresolvable_remote_fails_host_key_refresh() {
        let mut f = fixture(ScriptedGit::default(), true);
        f.sync.target.url = "/srv/git/site.git".into();

        assert!(matches!(
            f.sync.refresh_host_keys().await,
            Err(SyncError::UnresolvableHost(_))
        ));
    }
}
