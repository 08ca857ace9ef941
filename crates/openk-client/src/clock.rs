//! 时钟抽象
//!
//! 控制循环、回放和标定都通过 [`Clock`] 取时间和睡眠，
//! 测试中用 [`ManualClock`] 得到确定的时间戳。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 单调时钟
pub trait Clock: Send {
    /// 自时钟创建以来的时间
    fn now(&self) -> Duration;

    /// 睡眠到 `deadline`（已过期则立即返回）
    fn sleep_until(&self, deadline: Duration);

    fn sleep(&self, duration: Duration) {
        self.sleep_until(self.now() + duration);
    }
}

/// 基于 `Instant` 的真实时钟，睡眠使用 `spin_sleep`（亚毫秒精度）
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep_until(&self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            spin_sleep::sleep(deadline - now);
        }
    }
}

/// 手动推进的时钟：睡眠即把时间拨到截止点
///
/// Clone 共享同一时间，可在模拟总线的钩子里推进以模拟耗时。
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos.fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now: Duration) {
        self.nanos.store(now.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep_until(&self, deadline: Duration) {
        self.nanos.fetch_max(deadline.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl<C: Clock + Sync> Clock for Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep_until(&self, deadline: Duration) {
        (**self).sleep_until(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let shared = clock.clone();
        assert_eq!(clock.now(), Duration::ZERO);

        shared.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), Duration::from_millis(5));

        clock.sleep_until(Duration::from_millis(3));
        assert_eq!(clock.now(), Duration::from_millis(5));
        clock.sleep_until(Duration::from_millis(8));
        assert_eq!(shared.now(), Duration::from_millis(8));

        clock.sleep(Duration::from_millis(2));
        assert_eq!(clock.now(), Duration::from_millis(10));
    }

    #[test]
    fn test_monotonic_clock_sleeps() {
        let clock = MonotonicClock::new();
        let start = clock.now();
        clock.sleep_until(start + Duration::from_millis(2));
        assert!(clock.now() >= start + Duration::from_millis(2));
    }
}
