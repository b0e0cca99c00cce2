use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct RateLimiter {
    window: Duration,
    max: usize,
    entries: Arc<Mutex<HashMap<IpAddr, Vec<Instant>>>>,
}

impl RateLimiter {
    /// A `max` of zero disables limiting.
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max > 0
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    /// Rejected requests are not recorded.
    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let mut map = self.lock();
        let timestamps = map.entry(ip).or_default();
        retain_recent(timestamps, now, self.window);

        if timestamps.len() >= self.max {
            return false;
        }
        timestamps.push(now);
        true
    }

    pub fn sweep(&self) {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) {
        let mut map = self.lock();
        map.retain(|_, timestamps| {
            retain_recent(timestamps, now, self.window);
            !timestamps.is_empty()
        });
    }

    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.is_enabled() || self.window.is_zero() {
            return None;
        }

        let limiter = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.window);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.sweep();
                        debug!("Rate limit ledger swept, {} addresses tracked", limiter.tracked());
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        }))
    }

    fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Vec<Instant>>> {
        // 账本里只有时间戳，中毒后继续使用不会破坏不变量
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn retain_recent(timestamps: &mut Vec<Instant>, now: Instant, window: Duration) {
    // 进程启动不足一个窗口时无法计算截止点，所有记录都仍有效
    if let Some(cutoff) = now.checked_sub(window) {
        timestamps.retain(|t| *t > cutoff);
    }
}
