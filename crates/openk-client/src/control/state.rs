//! 循环状态机
//!
//! `Idle → Connected → Running → Stopping → Idle`，
//! 状态存放在原子量里，其他线程可以无锁读取。

use std::sync::atomic::{AtomicU8, Ordering};

/// 控制循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoopState {
    /// 未连接
    Idle = 0,
    /// 已探测两条总线，从臂上扭矩
    Connected = 1,
    /// 正在运行 tick
    Running = 2,
    /// 正在停止（收尾录制、按配置卸扭矩）
    Stopping = 3,
}

impl LoopState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Connected,
            2 => LoopState::Running,
            3 => LoopState::Stopping,
            _ => LoopState::Idle,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LoopState::Idle => "idle",
            LoopState::Connected => "connected",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
        })
    }
}

/// 原子状态
#[derive(Debug)]
pub struct AtomicLoopState {
    inner: AtomicU8,
}

impl AtomicLoopState {
    pub fn new(state: LoopState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self) -> LoopState {
        LoopState::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub fn set(&self, state: LoopState) {
        self.inner.store(state.as_u8(), Ordering::Release);
    }

    /// 仅当当前状态为 `from` 时切换到 `to`，返回切换前的状态
    pub fn transition(&self, from: LoopState, to: LoopState) -> Result<(), LoopState> {
        self.inner
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LoopState::from_u8)
    }
}

impl Default for AtomicLoopState {
    fn default() -> Self {
        Self::new(LoopState::Idle)
    }
}
