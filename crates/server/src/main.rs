mod config;
mod guard;
mod http;
mod rate_limit;
mod state;

use anyhow::Context;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use storage::git::{KnownHosts, ShellGit, SshKeyscan};
use storage::{Synchronizer, WorkingCopy};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use adapter::RepoHandle;
use config::Settings;
use guard::Guard;
use http::router::build_router;
use rate_limit::RateLimiter;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let config = Settings::new()
        .context("Failed to load configuration")?
        .resolve()
        .context("Invalid configuration")?;
    config.log_summary();

    let working_copy = WorkingCopy::new(
        &config.repo.work_dir,
        &config.repo.comments_path,
        config.repo.posts_path.clone(),
    );

    let mut sync = Synchronizer::new(
        ShellGit::new(&config.ssh),
        SshKeyscan,
        KnownHosts::new(&config.ssh.known_hosts_path),
        config.repo_target(),
        config.repo.identity.clone(),
        working_copy.clone(),
    );
    // 没有工作区就无法提供服务
    sync.clone_or_pull()
        .await
        .context("Failed to prepare the repository working copy")?;

    let cancel = CancellationToken::new();

    let (tx_cmd, rx_cmd) = mpsc::channel(100);
    let worker = tokio::spawn(adapter::start(sync, rx_cmd, cancel.clone()));

    let limiter = RateLimiter::new(config.rate_limit.window, config.rate_limit.max);
    let sweeper = limiter.spawn_sweeper(cancel.clone());

    let state = AppState {
        guard: Guard::new(config.guard, limiter),
        working_copy,
        publisher: Arc::new(RepoHandle::new(tx_cmd)),
    };

    let app = build_router(state, config.server.request_timeout());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address: {}", addr))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // 服务器已停止接收请求，worker 会先做完手上的提交再退出
    cancel.cancel();
    if let Err(e) = worker.await {
        tracing::error!("Publishing worker panicked: {:?}", e);
    }
    if let Some(sweeper) = sweeper {
        sweeper.await.ok();
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}
