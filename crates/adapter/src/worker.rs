use anyhow::{anyhow, Result};
use async_trait::async_trait;
use domain::{RepoCommand, Slug};
use std::path::PathBuf;
use storage::git::{GitBackend, HostKeyScanner};
use storage::Synchronizer;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::traits::Publisher;
use crate::CommandEnvelope;

// 命令逐条执行；已开始的命令总会执行完毕
pub async fn start<B, K>(
    mut sync: Synchronizer<B, K>,
    mut rx_cmd: mpsc::Receiver<CommandEnvelope>,
    cancel_token: CancellationToken,
) where
    B: GitBackend,
    K: HostKeyScanner,
{
    info!("Publishing worker started");
    loop {
        tokio::select! {
            cmd_opt = rx_cmd.recv() => {
                let Some(CommandEnvelope { cmd, resp }) = cmd_opt else {
                    break;
                };

                let result = match cmd {
                    RepoCommand::Pull => sync.pull().await,
                    RepoCommand::CommitAndPush { path, slug } => {
                        sync.commit_and_push(&path, &slug).await
                    }
                };

                if let Err(ref e) = result {
                    error!("Command execution failed: {:?}", e);
                }
                // 调用方可能已超时离开，结果无人接收也无妨
                let _ = resp.send(result.map_err(anyhow::Error::from));
            },
            _ = cancel_token.cancelled() => break,
        }
    }
    info!("Publishing worker stopped");
}

#[derive(Clone)]
pub struct RepoHandle {
    sender: mpsc::Sender<CommandEnvelope>,
}

impl RepoHandle {
    pub fn new(sender: mpsc::Sender<CommandEnvelope>) -> Self {
        Self { sender }
    }

    /// Queues `cmd` behind any in-flight work and waits for its outcome.
    pub async fn execute(&self, cmd: RepoCommand) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CommandEnvelope { cmd, resp: tx })
            .await
            .map_err(|_| anyhow!("Worker closed"))?;
        rx.await.map_err(|_| anyhow!("Worker dropped the command"))?
    }

    pub async fn pull(&self) -> Result<()> {
        self.execute(RepoCommand::Pull).await
    }
}

#[async_trait]
impl Publisher for RepoHandle {
    async fn publish(&self, path: PathBuf, slug: Slug) -> Result<()> {
        self.execute(RepoCommand::CommitAndPush { path, slug }).await
    }
}
