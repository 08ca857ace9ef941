//! 主从遥操作控制循环
//!
//! 每个 tick：
//! 1. 读主臂原始位置 → 用主臂标定归一化
//! 2. 关节映射（截断到从臂标定边界、可选单步限幅）
//! 3. 用从臂标定反归一化 → 写从臂
//! 4. 组装 (观测, 动作) 样本，非阻塞投递给录制端
//! 5. 节拍器睡眠到下一个锚点；超时则重新锚定
//!
//! 单次总线失败在 tick 内重试后计数并跳过该 tick；
//! 同一条总线连续失败达到阈值即停止循环并上报 [`ControlError::ConnectionFault`]。

mod state;
mod status;

pub use state::{AtomicLoopState, LoopState};
pub use status::{CancelToken, LoopStatus, StatusHandle};

use crate::clock::{Clock, MonotonicClock};
use crate::error::{BusRole, ControlError};
use crate::mapper::JointMapper;
use crate::pacing::{TickPacer, TickTiming};
use crate::recorder::{RecorderSink, Sample};
use openk_bus::{ActuatorBus, BusError, missing_ids};
use openk_protocol::JointState;
use openk_tools::{CalibrationSet, ObservationSource, TeleopConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// 配置
// ============================================================================

/// 控制循环参数
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub fps: f64,
    /// 同一条总线连续失败多少个 tick 后停止
    pub max_consecutive_failures: u32,
    /// tick 内的重试次数
    pub in_tick_retries: u32,
    /// 连续超时多少个 tick 后停止
    pub overrun_streak_limit: u32,
    pub observation: ObservationSource,
    /// 停止时是否卸掉从臂扭矩
    pub disable_follower_torque_on_exit: bool,
    /// 控制线程提升到实时优先级（需要 `realtime` feature）
    pub realtime: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            max_consecutive_failures: 3,
            in_tick_retries: 1,
            overrun_streak_limit: 30,
            observation: ObservationSource::Leader,
            disable_follower_torque_on_exit: false,
            realtime: false,
        }
    }
}

impl From<&TeleopConfig> for LoopConfig {
    fn from(config: &TeleopConfig) -> Self {
        Self {
            fps: config.fps,
            max_consecutive_failures: config.control.max_consecutive_failures,
            in_tick_retries: config.control.in_tick_retries,
            overrun_streak_limit: config.control.overrun_streak_limit,
            observation: config.control.observation,
            disable_follower_torque_on_exit: config.follower.disable_torque_on_disconnect,
            realtime: config.control.realtime,
        }
    }
}

/// 运行时长限制
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunLimit {
    ticks: Option<u64>,
    duration: Option<Duration>,
}

impl RunLimit {
    /// 直到取消
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn ticks(ticks: u64) -> Self {
        Self {
            ticks: Some(ticks),
            duration: None,
        }
    }

    /// 按时长限制，换算为 `round(duration × fps)` 个 tick
    pub fn duration(duration: Duration) -> Self {
        Self {
            ticks: None,
            duration: Some(duration),
        }
    }

    pub fn max_ticks(&self, fps: f64) -> Option<u64> {
        let from_duration = self.duration.map(|d| (d.as_secs_f64() * fps).round() as u64);
        match (self.ticks, from_duration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 达到 tick 或时长上限
    LimitReached,
    /// 取消令牌被触发
    Cancelled,
}

/// 一次运行的汇总
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub ticks: u64,
    /// 因总线失败跳过的 tick
    pub skipped_ticks: u64,
    pub overruns: u64,
    pub clamp_events: u64,
    pub leader_failures: u64,
    pub follower_failures: u64,
    pub recorder_dropped: u64,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

// ============================================================================
// 失败计数
// ============================================================================

#[derive(Debug)]
pub(crate) struct FailureTracker {
    role: BusRole,
    threshold: u32,
    consecutive: u32,
    pub(crate) total: u64,
}

impl FailureTracker {
    pub(crate) fn new(role: BusRole, threshold: u32) -> Self {
        Self {
            role,
            threshold: threshold.max(1),
            consecutive: 0,
            total: 0,
        }
    }

    pub(crate) fn success(&mut self) {
        if self.consecutive > 0 {
            info!("{} bus recovered after {} failed ticks", self.role, self.consecutive);
        }
        self.consecutive = 0;
    }

    /// 记录一次失败；达到阈值或设备已不可用时返回致命错误
    pub(crate) fn failure(&mut self, tick: u64, error: BusError) -> Result<(), ControlError> {
        self.consecutive += 1;
        self.total += 1;
        if error.is_fatal() || self.consecutive >= self.threshold {
            error!(
                "{} bus failed {} consecutive ticks (last: {}), stopping",
                self.role, self.consecutive, error
            );
            return Err(ControlError::ConnectionFault {
                role: self.role,
                tick,
                count: self.consecutive,
                last_error: Box::new(error),
            });
        }
        warn!(
            "{} bus failure at tick {} ({}/{}): {}",
            self.role, tick, self.consecutive, self.threshold, error
        );
        Ok(())
    }
}

/// tick 内重试：致命错误不重试
pub(crate) fn with_retries<T>(retries: u32, mut op: impl FnMut() -> Result<T, BusError>) -> Result<T, BusError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_fatal() || attempt >= retries => return Err(e),
            Err(e) => {
                attempt += 1;
                debug!("Bus operation failed, retrying ({}/{}): {}", attempt, retries, e);
            },
        }
    }
}

/// 探测总线，所有配置的执行器都必须应答
pub(crate) fn probe_bus<B: ActuatorBus>(bus: &mut B, role: BusRole) -> Result<(), ControlError> {
    let present = bus.probe().map_err(ControlError::bus(role))?;
    let missing = missing_ids(&bus.joint_ids(), &present);
    if !missing.is_empty() {
        error!("{} bus is missing actuators {:?}", role, missing);
        return Err(ControlError::MissingActuators { role, missing });
    }
    debug!("{} bus: all {} actuators present", role, present.len());
    Ok(())
}

enum TickOutcome {
    Completed,
    Skipped,
}

struct Trackers {
    leader: FailureTracker,
    follower: FailureTracker,
}

// ============================================================================
// 控制循环
// ============================================================================

/// 控制循环
///
/// 两条总线由循环独占；状态、快照和取消令牌可以交给其他线程。
pub struct ControlLoop<L, F, C = MonotonicClock>
where
    L: ActuatorBus,
    F: ActuatorBus,
    C: Clock,
{
    leader: L,
    follower: F,
    clock: C,
    leader_calibration: Arc<CalibrationSet>,
    follower_calibration: Arc<CalibrationSet>,
    mapper: JointMapper,
    config: LoopConfig,
    state: Arc<AtomicLoopState>,
    status: StatusHandle,
    cancel: CancelToken,
    recorder: Option<RecorderSink>,
}

impl<L, F> ControlLoop<L, F, MonotonicClock>
where
    L: ActuatorBus,
    F: ActuatorBus,
{
    pub fn new(
        leader: L,
        follower: F,
        leader_calibration: Arc<CalibrationSet>,
        follower_calibration: Arc<CalibrationSet>,
        mapper: JointMapper,
        config: LoopConfig,
    ) -> Result<Self, ControlError> {
        Self::with_clock(
            leader,
            follower,
            leader_calibration,
            follower_calibration,
            mapper,
            config,
            MonotonicClock::new(),
        )
    }
}

impl<L, F, C> ControlLoop<L, F, C>
where
    L: ActuatorBus,
    F: ActuatorBus,
    C: Clock,
{
    pub fn with_clock(
        leader: L,
        follower: F,
        leader_calibration: Arc<CalibrationSet>,
        follower_calibration: Arc<CalibrationSet>,
        mapper: JointMapper,
        config: LoopConfig,
        clock: C,
    ) -> Result<Self, ControlError> {
        if TickPacer::from_fps(config.fps).is_none() {
            return Err(ControlError::InvalidFps { fps: config.fps });
        }
        if leader.len() != leader_calibration.len() {
            return Err(ControlError::LayoutMismatch {
                role: BusRole::Leader,
                expected: leader_calibration.len(),
                actual: leader.len(),
            });
        }
        if follower.len() != follower_calibration.len() || mapper.len() != follower.len() {
            return Err(ControlError::LayoutMismatch {
                role: BusRole::Follower,
                expected: follower_calibration.len(),
                actual: follower.len(),
            });
        }
        Ok(Self {
            leader,
            follower,
            clock,
            leader_calibration,
            follower_calibration,
            mapper,
            config,
            state: Arc::new(AtomicLoopState::default()),
            status: StatusHandle::default(),
            cancel: CancelToken::new(),
            recorder: None,
        })
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    /// 可跨线程读取的状态
    pub fn state_handle(&self) -> Arc<AtomicLoopState> {
        Arc::clone(&self.state)
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn mapper(&self) -> &JointMapper {
        &self.mapper
    }

    pub fn attach_recorder(&mut self, sink: RecorderSink) {
        self.recorder = Some(sink);
    }

    pub fn detach_recorder(&mut self) -> Option<RecorderSink> {
        self.recorder.take()
    }

    pub fn recorder_mut(&mut self) -> Option<&mut RecorderSink> {
        self.recorder.as_mut()
    }

    pub fn leader(&self) -> &L {
        &self.leader
    }

    pub fn follower(&self) -> &F {
        &self.follower
    }

    /// 拆出两条总线
    pub fn into_buses(self) -> (L, F) {
        (self.leader, self.follower)
    }

    fn expect_state(&self, expected: LoopState) -> Result<(), ControlError> {
        let actual = self.state.get();
        if actual != expected {
            return Err(ControlError::InvalidState { expected, actual });
        }
        Ok(())
    }

    /// 探测两条总线、主臂卸扭矩、从臂上扭矩，并以从臂当前位置初始化映射器
    pub fn connect(&mut self) -> Result<(), ControlError> {
        self.expect_state(LoopState::Idle)?;

        probe_bus(&mut self.leader, BusRole::Leader)?;
        probe_bus(&mut self.follower, BusRole::Follower)?;

        self.leader
            .set_torque(false)
            .map_err(ControlError::bus(BusRole::Leader))?;

        let present = self
            .follower
            .read_positions()
            .map_err(ControlError::bus(BusRole::Follower))?;
        let normalized = self.follower_calibration.to_normalized(&present)?;
        debug!("Follower starts at [{}]", summarize(&normalized));
        self.mapper.seed(&normalized);

        self.follower
            .set_torque(true)
            .map_err(ControlError::bus(BusRole::Follower))?;

        self.state.set(LoopState::Connected);
        self.publish(LoopStatus {
            state: LoopState::Connected,
            ..LoopStatus::default()
        });
        info!(
            "Connected: leader {} joints on {}, follower {} joints on {}",
            self.leader.len(),
            self.leader.kind(),
            self.follower.len(),
            self.follower.kind()
        );
        Ok(())
    }

    /// 未运行时断开
    pub fn disconnect(&mut self) -> Result<(), ControlError> {
        self.expect_state(LoopState::Connected)?;
        self.state.set(LoopState::Stopping);
        self.release_follower();
        self.state.set(LoopState::Idle);
        self.publish(LoopStatus::default());
        Ok(())
    }

    /// 运行循环直到达到上限、被取消或发生致命错误
    ///
    /// 无论结果如何，返回时状态都已回到 `Idle`。
    pub fn run(&mut self, limit: RunLimit) -> Result<LoopReport, ControlError> {
        self.expect_state(LoopState::Connected)?;
        self.state.set(LoopState::Running);

        if self.config.realtime {
            raise_thread_priority();
        }

        let result = self.run_ticks(limit);

        self.state.set(LoopState::Stopping);
        if let Some(sink) = self.recorder.as_mut() {
            if let Err(e) = sink.flush() {
                error!("Failed to flush recorder buffer: {}", e);
            }
        }
        self.release_follower();
        self.state.set(LoopState::Idle);

        let mut status = (*self.status.load()).clone();
        status.state = LoopState::Idle;
        if let Err(e) = &result {
            status.last_error = Some(e.to_string());
        }
        self.publish(status);

        match &result {
            Ok(report) => info!(
                "Control loop stopped ({:?}) after {} ticks, {} overruns, {} clamps",
                report.stop_reason, report.ticks, report.overruns, report.clamp_events
            ),
            Err(e) => error!("Control loop stopped: {}", e),
        }
        result
    }

    fn release_follower(&mut self) {
        if self.config.disable_follower_torque_on_exit {
            match self.follower.set_torque(false) {
                Ok(()) => info!("Follower torque disabled"),
                Err(e) => error!("Failed to disable follower torque: {}", e),
            }
        }
    }

    fn run_ticks(&mut self, limit: RunLimit) -> Result<LoopReport, ControlError> {
        let max_ticks = limit.max_ticks(self.config.fps);
        let mut pacer =
            TickPacer::from_fps(self.config.fps).ok_or(ControlError::InvalidFps { fps: self.config.fps })?;
        let mut trackers = Trackers {
            leader: FailureTracker::new(BusRole::Leader, self.config.max_consecutive_failures),
            follower: FailureTracker::new(BusRole::Follower, self.config.max_consecutive_failures),
        };
        let clamps_before = self.mapper.total_clamps();
        let session_start = self.clock.now();
        pacer.start(session_start);
        info!(
            "Control loop running at {} Hz (period {:?}, limit {:?} ticks)",
            self.config.fps,
            pacer.period(),
            max_ticks
        );

        let mut tick = 0u64;
        let mut skipped = 0u64;
        let stop_reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if let Some(max) = max_ticks {
                if tick >= max {
                    break StopReason::LimitReached;
                }
            }

            pacer.begin_tick();
            let timestamp_us = (self.clock.now().saturating_sub(session_start)).as_micros() as u64;
            if let TickOutcome::Skipped = self.step(tick, timestamp_us, &mut trackers)? {
                skipped += 1;
            }
            tick += 1;

            if let TickTiming::Overrun { .. } = pacer.finish_tick(&self.clock) {
                if pacer.streak() >= self.config.overrun_streak_limit {
                    error!("{} consecutive overruns, stopping", pacer.streak());
                    return Err(ControlError::DeadlineOverrun {
                        tick,
                        streak: pacer.streak(),
                    });
                }
            }

            self.publish(LoopStatus {
                state: LoopState::Running,
                tick,
                overruns: pacer.overruns(),
                overrun_streak: pacer.streak(),
                clamp_events: self.mapper.total_clamps() - clamps_before,
                leader_failures: trackers.leader.total,
                follower_failures: trackers.follower.total,
                skipped_ticks: skipped,
                recorder_dropped: self.recorder_dropped(),
                last_error: None,
            });
        };

        Ok(LoopReport {
            ticks: tick,
            skipped_ticks: skipped,
            overruns: pacer.overruns(),
            clamp_events: self.mapper.total_clamps() - clamps_before,
            leader_failures: trackers.leader.total,
            follower_failures: trackers.follower.total,
            recorder_dropped: self.recorder_dropped(),
            elapsed: self.clock.now().saturating_sub(session_start),
            stop_reason,
        })
    }

    fn step(&mut self, tick: u64, timestamp_us: u64, trackers: &mut Trackers) -> Result<TickOutcome, ControlError> {
        let retries = self.config.in_tick_retries;

        // 读主臂
        let leader_raw = match with_retries(retries, || self.leader.read_positions()) {
            Ok(state) => {
                trackers.leader.success();
                state
            },
            Err(e) => {
                trackers.leader.failure(tick, e)?;
                return Ok(TickOutcome::Skipped);
            },
        };
        let leader_normalized = self.leader_calibration.to_normalized(&leader_raw)?;

        // 映射并写从臂
        let action = self.mapper.map(&leader_normalized)?;
        let follower_raw = self.follower_calibration.to_raw(&action)?;
        match with_retries(retries, || self.follower.write_positions(&follower_raw)) {
            Ok(()) => trackers.follower.success(),
            Err(e) => {
                trackers.follower.failure(tick, e)?;
                return Ok(TickOutcome::Skipped);
            },
        }

        // 观测
        let observation = match self.config.observation {
            ObservationSource::Leader => leader_normalized,
            ObservationSource::Follower => match with_retries(retries, || self.follower.read_positions()) {
                Ok(raw) => {
                    trackers.follower.success();
                    self.follower_calibration.to_normalized(&raw)?
                },
                Err(e) => {
                    trackers.follower.failure(tick, e)?;
                    return Ok(TickOutcome::Skipped);
                },
            },
        };

        if let Some(sink) = self.recorder.as_mut() {
            sink.offer(Sample {
                timestamp_us,
                observation,
                action,
            });
        }
        Ok(TickOutcome::Completed)
    }

    fn recorder_dropped(&self) -> u64 {
        self.recorder.as_ref().map_or(0, |sink| sink.stats().dropped)
    }

    fn publish(&self, status: LoopStatus) {
        self.status.publish(status);
    }
}

/// 把当前线程提升到最高优先级
pub(crate) fn raise_thread_priority() {
    #[cfg(feature = "realtime")]
    {
        use thread_priority::*;

        match set_current_thread_priority(ThreadPriority::Max) {
            Ok(_) => {
                info!("Control thread priority set to MAX (realtime)");
            },
            Err(e) => {
                warn!(
                    "Failed to set control thread priority: {:?}. \
                    On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                    e
                );
            },
        }
    }

    #[cfg(not(feature = "realtime"))]
    warn!("Realtime priority requested but openk-client was built without the `realtime` feature");
}

/// 一帧归一化状态，便于日志输出
pub(crate) fn summarize(state: &JointState) -> String {
    state
        .positions
        .iter()
        .map(|v| format!("{:.2}", v))
        .collect::<Vec<_>>()
        .join(", ")
}
