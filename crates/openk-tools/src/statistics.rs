//! # 统计工具
//!
//! 帧间隔统计与帧率一致性检查（纯函数）

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 帧间隔统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalStats {
    /// 间隔数量（帧数 - 1）
    pub intervals: usize,

    /// 平均间隔（微秒）
    pub mean_us: f64,

    /// 最小间隔（微秒）
    pub min_us: u64,

    /// 最大间隔（微秒）
    pub max_gap_us: u64,

    /// 标准差（微秒）
    pub std_dev_us: f64,
}

impl IntervalStats {
    /// 从单调时间戳序列计算；少于两个时间戳时返回 `None`
    pub fn from_timestamps(timestamps_us: &[u64]) -> Option<Self> {
        if timestamps_us.len() < 2 {
            return None;
        }

        let gaps: Vec<u64> = timestamps_us
            .windows(2)
            .map(|w| w[1].saturating_sub(w[0]))
            .collect();
        let n = gaps.len() as f64;
        let mean_us = gaps.iter().sum::<u64>() as f64 / n;
        let variance = gaps
            .iter()
            .map(|&g| {
                let d = g as f64 - mean_us;
                d * d
            })
            .sum::<f64>()
            / n;

        Some(Self {
            intervals: gaps.len(),
            mean_us,
            min_us: gaps.iter().copied().min().unwrap_or(0),
            max_gap_us: gaps.iter().copied().max().unwrap_or(0),
            std_dev_us: variance.sqrt(),
        })
    }

    /// 实测帧率（帧/秒）
    pub fn measured_fps(&self) -> f64 {
        if self.mean_us <= 0.0 {
            return 0.0;
        }
        1_000_000.0 / self.mean_us
    }
}

/// tick 周期（微秒）
pub fn period_us(fps: f64) -> f64 {
    1_000_000.0 / fps
}

// ============================================================================
// 帧率一致性
// ============================================================================

/// 帧率检查失败原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FpsViolation {
    #[error("Need at least 2 frames to measure FPS, got {frames}")]
    TooFewFrames { frames: usize },

    #[error("Measured {measured:.3} fps deviates from target {target:.3} fps beyond relative tolerance {tolerance}")]
    RateMismatch { measured: f64, target: f64, tolerance: f64 },

    #[error("Gap of {gap_us} us exceeds {limit_us:.0} us ({factor}x the tick period)")]
    GapTooLarge { gap_us: u64, limit_us: f64, factor: f64 },
}

/// 帧率检查策略
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FpsPolicy {
    /// 实测帧率允许的相对误差（0.05 = 5%）
    pub tolerance: f64,
    /// 单个间隔不得超过 `max_gap_factor × 周期`
    pub max_gap_factor: f64,
}

impl Default for FpsPolicy {
    fn default() -> Self {
        Self {
            tolerance: 0.05,
            max_gap_factor: 1.5,
        }
    }
}

impl FpsPolicy {
    /// 检查时间戳序列是否符合目标帧率
    pub fn check(&self, timestamps_us: &[u64], target_fps: f64) -> Result<IntervalStats, FpsViolation> {
        let stats = IntervalStats::from_timestamps(timestamps_us).ok_or(FpsViolation::TooFewFrames {
            frames: timestamps_us.len(),
        })?;

        let limit_us = period_us(target_fps) * self.max_gap_factor;
        if stats.max_gap_us as f64 > limit_us {
            return Err(FpsViolation::GapTooLarge {
                gap_us: stats.max_gap_us,
                limit_us,
                factor: self.max_gap_factor,
            });
        }

        let measured = stats.measured_fps();
        if (measured - target_fps).abs() > self.tolerance * target_fps {
            return Err(FpsViolation::RateMismatch {
                measured,
                target: target_fps,
                tolerance: self.tolerance,
            });
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks(n: u64, period_us: u64) -> Vec<u64> {
        (0..n).map(|i| i * period_us).collect()
    }

    #[test]
    fn test_interval_stats() {
        let stats = IntervalStats::from_timestamps(&[0, 10, 30, 40]).unwrap();
        assert_eq!(stats.intervals, 3);
        assert!((stats.mean_us - 40.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.min_us, 10);
        assert_eq!(stats.max_gap_us, 20);
        assert!(stats.std_dev_us > 0.0);

        assert!(IntervalStats::from_timestamps(&[5]).is_none());
    }

    #[test]
    fn test_policy_accepts_steady_rate() {
        let stats = FpsPolicy::default().check(&ticks(30, 33_333), 30.0).unwrap();
        assert!((stats.measured_fps() - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_policy_rejects_large_gap() {
        let mut ts = ticks(30, 33_333);
        // 第 10 帧之后整体推迟 20 ms：该间隔为 1.6 倍周期
        for t in ts.iter_mut().skip(10) {
            *t += 20_000;
        }
        let err = FpsPolicy {
            tolerance: 1.0,
            max_gap_factor: 1.5,
        }
        .check(&ts, 30.0)
        .unwrap_err();
        assert!(matches!(err, FpsViolation::GapTooLarge { gap_us: 53_333, .. }));
    }

    #[test]
    fn test_policy_rejects_rate_mismatch() {
        let err = FpsPolicy::default().check(&ticks(30, 40_000), 30.0).unwrap_err();
        assert!(matches!(err, FpsViolation::RateMismatch { .. }));
    }

    #[test]
    fn test_policy_needs_two_frames() {
        assert_eq!(
            FpsPolicy::default().check(&[0], 30.0),
            Err(FpsViolation::TooFewFrames { frames: 1 })
        );
    }
}
