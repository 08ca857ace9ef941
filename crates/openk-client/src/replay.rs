//! 片段回放
//!
//! [`replay`] 把已封存的片段转成一次性的动作流；
//! [`ReplayEngine`] 只驱动从臂写入，按片段帧率和控制循环相同的节拍纪律发送。

use crate::clock::{Clock, MonotonicClock};
use crate::control::{CancelToken, FailureTracker, LoopConfig, StopReason, probe_bus, with_retries};
use crate::error::{BusRole, ControlError};
use crate::pacing::{TickPacer, TickTiming};
use openk_bus::ActuatorBus;
use openk_protocol::JointState;
use openk_tools::dataset::Dataset;
use openk_tools::{CalibrationError, CalibrationSet, Episode, EpisodeError, Frame};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// 回放错误
#[derive(Debug, Error)]
pub enum ReplayError {
    /// 片段数据不完整，回放不会开始
    #[error("Episode {index} is corrupt: {source}")]
    EpisodeCorrupt {
        index: u32,
        #[source]
        source: EpisodeError,
    },

    #[error("Failed to load episode {index}: {reason}")]
    Load { index: u32, reason: String },

    #[error("Episode has {actual} joints but the follower has {expected}")]
    LayoutMismatch { expected: usize, actual: usize },

    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

// ============================================================================
// 动作流
// ============================================================================

/// 片段的动作序列
///
/// 有限、惰性、只能消费一次。
#[derive(Debug)]
pub struct ReplayStream {
    index: u32,
    fps: f64,
    frames: std::vec::IntoIter<Frame>,
}

impl ReplayStream {
    pub fn episode_index(&self) -> u32 {
        self.index
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

impl Iterator for ReplayStream {
    type Item = JointState;

    fn next(&mut self) -> Option<JointState> {
        self.frames.next().map(|frame| frame.action)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.frames.size_hint()
    }
}

impl ExactSizeIterator for ReplayStream {}

/// 校验片段并生成动作流
///
/// 帧率非法、帧序号不连续、时间戳不递增都视为损坏，在任何动作发出前返回。
pub fn replay(episode: Episode) -> Result<ReplayStream, ReplayError> {
    episode.check_contiguous().map_err(|source| ReplayError::EpisodeCorrupt {
        index: episode.index,
        source,
    })?;
    debug!("Episode {} ready for replay: {} frames", episode.index, episode.len());
    Ok(ReplayStream {
        index: episode.index,
        fps: episode.fps,
        frames: episode.frames.into_iter(),
    })
}

/// 从数据集加载片段并生成动作流
pub fn replay_from_dataset(dataset: &Dataset, index: u32) -> Result<ReplayStream, ReplayError> {
    let episode = dataset.load_episode(index).map_err(|e| ReplayError::Load {
        index,
        reason: format!("{:#}", e),
    })?;
    replay(episode)
}

// ============================================================================
// 回放引擎
// ============================================================================

/// 回放汇总
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub episode_index: u32,
    pub frames_sent: u64,
    pub skipped: u64,
    pub overruns: u64,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

/// 回放引擎
pub struct ReplayEngine<F, C = MonotonicClock>
where
    F: ActuatorBus,
    C: Clock,
{
    follower: F,
    calibration: Arc<CalibrationSet>,
    clock: C,
    max_consecutive_failures: u32,
    in_tick_retries: u32,
    disable_torque_on_exit: bool,
    cancel: CancelToken,
}

impl<F: ActuatorBus> ReplayEngine<F, MonotonicClock> {
    pub fn new(follower: F, calibration: Arc<CalibrationSet>, config: &LoopConfig) -> Result<Self, ReplayError> {
        Self::with_clock(follower, calibration, config, MonotonicClock::new())
    }
}

impl<F, C> ReplayEngine<F, C>
where
    F: ActuatorBus,
    C: Clock,
{
    pub fn with_clock(
        follower: F,
        calibration: Arc<CalibrationSet>,
        config: &LoopConfig,
        clock: C,
    ) -> Result<Self, ReplayError> {
        if follower.len() != calibration.len() {
            return Err(ControlError::LayoutMismatch {
                role: BusRole::Follower,
                expected: calibration.len(),
                actual: follower.len(),
            }
            .into());
        }
        Ok(Self {
            follower,
            calibration,
            clock,
            max_consecutive_failures: config.max_consecutive_failures,
            in_tick_retries: config.in_tick_retries,
            disable_torque_on_exit: config.disable_follower_torque_on_exit,
            cancel: CancelToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn follower(&self) -> &F {
        &self.follower
    }

    pub fn into_follower(self) -> F {
        self.follower
    }

    /// 按片段帧率把动作流写到从臂
    pub fn run(&mut self, mut stream: ReplayStream) -> Result<ReplayReport, ReplayError> {
        let expected = self.follower.len();
        if let Some(first) = stream.frames.as_slice().first() {
            if first.action.len() != expected {
                return Err(ReplayError::LayoutMismatch {
                    expected,
                    actual: first.action.len(),
                });
            }
        }

        probe_bus(&mut self.follower, BusRole::Follower)?;
        self.follower
            .set_torque(true)
            .map_err(ControlError::bus(BusRole::Follower))?;

        info!(
            "Replaying episode {} ({} frames @ {} fps)",
            stream.index,
            stream.len(),
            stream.fps
        );
        let result = self.drive(&mut stream);

        if self.disable_torque_on_exit {
            if let Err(e) = self.follower.set_torque(false) {
                warn!("Failed to disable follower torque after replay: {}", e);
            }
        }
        result
    }

    fn drive(&mut self, stream: &mut ReplayStream) -> Result<ReplayReport, ReplayError> {
        let mut pacer = TickPacer::from_fps(stream.fps).ok_or(ReplayError::EpisodeCorrupt {
            index: stream.index,
            source: EpisodeError::InvalidFps {
                episode_index: stream.index,
                fps: stream.fps,
            },
        })?;
        let mut failures = FailureTracker::new(BusRole::Follower, self.max_consecutive_failures);
        let start = self.clock.now();
        pacer.start(start);

        let mut tick = 0u64;
        let mut sent = 0u64;
        let mut skipped = 0u64;
        let mut stop_reason = StopReason::LimitReached;

        for action in stream.by_ref() {
            if self.cancel.is_cancelled() {
                info!("Replay cancelled at frame {}", tick);
                stop_reason = StopReason::Cancelled;
                break;
            }
            pacer.begin_tick();

            let raw = self.calibration.to_raw(&action)?;
            match with_retries(self.in_tick_retries, || self.follower.write_positions(&raw)) {
                Ok(()) => {
                    failures.success();
                    sent += 1;
                    trace!("Replay frame {} sent", tick);
                },
                Err(e) => {
                    failures.failure(tick, e)?;
                    skipped += 1;
                },
            }
            tick += 1;

            if let TickTiming::Overrun { late } = pacer.finish_tick(&self.clock) {
                debug!("Replay frame {} late by {:?}", tick, late);
            }
        }

        let report = ReplayReport {
            episode_index: stream.index,
            frames_sent: sent,
            skipped,
            overruns: pacer.overruns(),
            elapsed: self.clock.now().saturating_sub(start),
            stop_reason,
        };
        info!(
            "Replay of episode {} finished: {} frames sent, {} skipped, {} overruns",
            report.episode_index, report.frames_sent, report.skipped, report.overruns
        );
        Ok(report)
    }
}
