//! 固定周期节拍器（循环锚点）
//!
//! 每个 tick 开始时把锚点推进一个周期；tick 结束后睡眠到锚点。
//! 若已错过锚点则不睡眠，并把锚点重置到当前时间，延迟不会累积。

use crate::clock::Clock;
use std::time::Duration;
use tracing::warn;

/// 一个 tick 的时序结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickTiming {
    /// 按时完成，`slack` 为剩余时间
    OnTime { slack: Duration },
    /// 超时，`late` 为超出锚点的时间
    Overrun { late: Duration },
}

/// 节拍器
#[derive(Debug, Clone)]
pub struct TickPacer {
    period: Duration,
    next_tick: Duration,
    overruns: u64,
    streak: u32,
}

impl TickPacer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_tick: Duration::ZERO,
            overruns: 0,
            streak: 0,
        }
    }

    /// 由帧率创建；帧率非正、非有限或周期为零时返回 `None`
    pub fn from_fps(fps: f64) -> Option<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / fps)
            .ok()
            .filter(|period| !period.is_zero())
            .map(Self::new)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// 以 `now` 为第一个 tick 的起点
    pub fn start(&mut self, now: Duration) {
        self.next_tick = now;
        self.overruns = 0;
        self.streak = 0;
    }

    /// 进入新 tick，返回本 tick 的截止时间
    pub fn begin_tick(&mut self) -> Duration {
        self.next_tick += self.period;
        self.next_tick
    }

    /// 结束 tick：睡眠到锚点，或记录超时并重新锚定
    pub fn finish_tick<C: Clock + ?Sized>(&mut self, clock: &C) -> TickTiming {
        let now = clock.now();
        if self.next_tick > now {
            let slack = self.next_tick - now;
            clock.sleep_until(self.next_tick);
            self.streak = 0;
            TickTiming::OnTime { slack }
        } else {
            let late = now - self.next_tick;
            self.overruns += 1;
            self.streak += 1;
            warn!(
                "Control loop overrun: tick took {:?} (period {:?}), skipping sleep to catch up",
                late + self.period,
                self.period
            );
            self.next_tick = now;
            TickTiming::Overrun { late }
        }
    }

    /// 累计超时次数
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// 当前连续超时次数
    pub fn streak(&self) -> u32 {
        self.streak
    }
}
