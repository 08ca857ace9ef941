//! 运行状态快照与取消令牌

use super::state::LoopState;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 循环的只读快照，每个 tick 发布一次
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStatus {
    pub state: LoopState,
    pub tick: u64,
    pub overruns: u64,
    pub overrun_streak: u32,
    pub clamp_events: u64,
    pub leader_failures: u64,
    pub follower_failures: u64,
    pub skipped_ticks: u64,
    pub recorder_dropped: u64,
    pub last_error: Option<String>,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Idle,
            tick: 0,
            overruns: 0,
            overrun_streak: 0,
            clamp_events: 0,
            leader_failures: 0,
            follower_failures: 0,
            skipped_ticks: 0,
            recorder_dropped: 0,
            last_error: None,
        }
    }
}

/// 可跨线程读取的状态句柄
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<ArcSwap<LoopStatus>>,
}

impl StatusHandle {
    pub fn load(&self) -> Arc<LoopStatus> {
        self.inner.load_full()
    }

    pub(crate) fn publish(&self, status: LoopStatus) {
        self.inner.store(Arc::new(status));
    }
}

/// 取消令牌：Ctrl-C 处理器或其他线程调用 [`CancelToken::cancel`]，
/// 循环在下一个 tick 边界停止
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 清除取消标志（下一次运行前调用）
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}
