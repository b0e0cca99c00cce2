mod traits;
mod worker;

pub use traits::Publisher;
pub use worker::{start, RepoHandle};

use domain::RepoCommand;
use tokio::sync::oneshot;

// --- 信封模式 ---
pub struct CommandEnvelope {
    pub cmd: RepoCommand,
    // 结果回传通道：调用方等待这个 Result
    pub resp: oneshot::Sender<anyhow::Result<()>>,
}
