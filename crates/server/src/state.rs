use adapter::Publisher;
use std::sync::Arc;
use storage::WorkingCopy;

use crate::guard::Guard;

#[derive(Clone)]
pub struct AppState {
    pub guard: Guard,
    // 只用于写评论文件和检查文章是否存在，git 操作全部交给发布 worker
    pub working_copy: WorkingCopy,
    pub publisher: Arc<dyn Publisher>,
}
