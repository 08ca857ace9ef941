//! 总线容错策略

use crate::{BusError, BusKind};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// 单条总线的超时、重试与坏包阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultPolicy {
    /// 单次请求等待应答的时间
    pub timeout: Duration,
    /// 超时后的重试次数（不含首次）
    pub max_retries: u32,
    /// 滚动窗口内允许的坏包数，超过即上报
    pub malformed_threshold: u32,
    /// 坏包统计窗口
    pub malformed_window: Duration,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10),
            max_retries: 2,
            malformed_threshold: 10,
            malformed_window: Duration::from_secs(1),
        }
    }
}

impl FaultPolicy {
    /// 总尝试次数
    pub const fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// 坏包滚动窗口计数器
#[derive(Debug)]
pub struct MalformedWindow {
    bus: BusKind,
    threshold: u32,
    window: Duration,
    events: VecDeque<Instant>,
    total: u64,
}

impl MalformedWindow {
    pub fn new(bus: BusKind, policy: &FaultPolicy) -> Self {
        Self {
            bus,
            threshold: policy.malformed_threshold,
            window: policy.malformed_window,
            events: VecDeque::new(),
            total: 0,
        }
    }

    /// 记录 `count` 个坏包
    ///
    /// 窗口内累计超过阈值时返回 `BusError::Malformed`，并清空窗口以免连续报错。
    pub fn record(&mut self, count: u32, now: Instant) -> Result<(), BusError> {
        if count == 0 {
            return Ok(());
        }
        self.total += count as u64;
        for _ in 0..count {
            self.events.push_back(now);
        }
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }

        let in_window = self.events.len() as u32;
        warn!(
            "{} bus: discarded {} malformed replies ({} within {:?})",
            self.bus, count, in_window, self.window
        );
        if in_window > self.threshold {
            self.events.clear();
            return Err(BusError::Malformed {
                bus: self.bus,
                count: in_window,
                window: self.window,
            });
        }
        Ok(())
    }

    /// 会话内坏包总数
    pub fn total(&self) -> u64 {
        self.total
    }
}
