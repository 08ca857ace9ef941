//! 客户端错误类型

use crate::control::LoopState;
use crate::mapper::MapperError;
use openk_bus::BusError;
use openk_tools::CalibrationError;
use thiserror::Error;

/// 总线角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusRole {
    Leader,
    Follower,
}

impl std::fmt::Display for BusRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BusRole::Leader => "leader",
            BusRole::Follower => "follower",
        })
    }
}

/// 控制循环错误
#[derive(Debug, Error)]
pub enum ControlError {
    /// 连续失败超过阈值，循环已停止
    #[error("Connection fault on {role} bus at tick {tick} after {count} consecutive failures: {last_error}")]
    ConnectionFault {
        role: BusRole,
        tick: u64,
        count: u32,
        #[source]
        last_error: Box<BusError>,
    },

    /// 探测时有执行器未应答
    #[error("{role} bus is missing actuators {missing:?}")]
    MissingActuators { role: BusRole, missing: Vec<u16> },

    /// 连续超时的 tick 过多
    #[error("Deadline overrun streak of {streak} ticks at tick {tick}")]
    DeadlineOverrun { tick: u64, streak: u32 },

    /// 控制频率无法换算成节拍周期
    #[error("Invalid loop rate: {fps} fps")]
    InvalidFps { fps: f64 },

    /// 状态不允许该操作
    #[error("Invalid loop state: expected {expected:?}, found {actual:?}")]
    InvalidState { expected: LoopState, actual: LoopState },

    /// 关节数与标定不一致
    #[error("{role} has {actual} joints but its calibration has {expected}")]
    LayoutMismatch {
        role: BusRole,
        expected: usize,
        actual: usize,
    },

    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Mapper error: {0}")]
    Mapper(#[from] MapperError),

    /// 连接/断开阶段的总线错误
    #[error("{role} bus error: {source}")]
    Bus {
        role: BusRole,
        #[source]
        source: BusError,
    },
}

impl ControlError {
    pub(crate) fn bus(role: BusRole) -> impl FnOnce(BusError) -> ControlError {
        move |source| ControlError::Bus { role, source }
    }

    /// 运行期致命错误（循环已停止）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ControlError::ConnectionFault { .. } | ControlError::DeadlineOverrun { .. }
        )
    }
}
