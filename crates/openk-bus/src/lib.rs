//! # OpenK Bus Adapter Layer
//!
//! 执行器总线适配层：把两种物理上完全不同的总线统一到 [`ActuatorBus`] 接口之后。
//!
//! - [`DamiaoBus`]：达妙多圈电机，CAN 多点总线（SocketCAN 或 USB-CAN 串口桥）
//! - [`StsBus`]：飞特 STS 舵机，串口菊花链（TTL 直连或经 CAN 网关）
//! - [`CompositeBus`]：把多条总线拼成一条关节向量（从臂 = 达妙 + STS）
//!
//! 控制循环只依赖 `ActuatorBus`，不关心主臂或从臂背后是哪种总线。

use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

pub use openk_protocol::{CanFrame, JointState};

mod composite;
mod damiao;
mod error;
mod fault;
pub mod serial;
mod sts;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use composite::{CompositeBus, Segment};
pub use damiao::{DamiaoBus, DamiaoControlMode, DamiaoMotor};
pub use error::BusError;
pub use fault::{FaultPolicy, MalformedWindow};
pub use sts::{CanGatewayLink, StsBus, StsLink, StsReadout, TtlLink};

pub use serial::{SerialCanAdapter, SerialLink};

#[cfg(feature = "serial")]
pub use serial::SerialPortLink;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

// ============================================================================
// CAN 传输
// ============================================================================

/// CAN 传输层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(String),
    #[error("Read timeout")]
    Timeout,
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
}

impl CanError {
    /// 设备已不可用（需要重新连接）
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::BusOff | CanError::NotStarted | CanError::Device(_) => true,
            CanError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            CanError::Timeout | CanError::BufferOverflow => false,
        }
    }
}

/// CAN 收发接口
pub trait CanAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError>;
    fn receive(&mut self) -> Result<CanFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
    fn receive_timeout(&mut self, timeout: Duration) -> Result<CanFrame, CanError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }
    fn try_receive(&mut self) -> Result<Option<CanFrame>, CanError> {
        match self.receive_timeout(Duration::ZERO) {
            Ok(frame) => Ok(Some(frame)),
            Err(CanError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<A: CanAdapter + ?Sized> CanAdapter for Box<A> {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        (**self).send(frame)
    }
    fn receive(&mut self) -> Result<CanFrame, CanError> {
        (**self).receive()
    }
    fn set_receive_timeout(&mut self, timeout: Duration) {
        (**self).set_receive_timeout(timeout)
    }
    fn receive_timeout(&mut self, timeout: Duration) -> Result<CanFrame, CanError> {
        (**self).receive_timeout(timeout)
    }
    fn try_receive(&mut self) -> Result<Option<CanFrame>, CanError> {
        (**self).try_receive()
    }
}

// ============================================================================
// 执行器总线
// ============================================================================

/// 总线类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// 达妙 CAN 多点总线
    Damiao,
    /// STS 串口菊花链
    Sts,
    /// 多条总线拼接
    Composite,
    /// 测试用模拟总线
    Mock,
}

impl std::fmt::Display for BusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BusKind::Damiao => "damiao",
            BusKind::Sts => "sts",
            BusKind::Composite => "composite",
            BusKind::Mock => "mock",
        };
        f.write_str(name)
    }
}

/// 执行器总线统一接口
///
/// 位置值使用执行器原始单位（达妙为 rad，STS 为编码器刻度），
/// 顺序与 [`ActuatorBus::joint_ids`] 一致。
///
/// 所有调用都是阻塞的，单次调用的耗时由 [`FaultPolicy`] 限定。
pub trait ActuatorBus {
    fn kind(&self) -> BusKind;

    /// 按关节顺序排列的执行器 ID
    fn joint_ids(&self) -> Vec<u16>;

    /// 关节数
    fn len(&self) -> usize {
        self.joint_ids().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 探测总线上实际应答的执行器 ID
    fn probe(&mut self) -> Result<BTreeSet<u16>, BusError>;

    /// 读取所有关节的原始位置
    ///
    /// 超时按策略重试，仍失败则返回 `BusError::Timeout`；坏包被丢弃并计数，
    /// 滚动窗口内超过阈值时返回 `BusError::Malformed`。
    fn read_positions(&mut self) -> Result<JointState, BusError>;

    /// 写入所有关节的原始目标位置
    ///
    /// 超出执行器量程的值被截断并记录日志，不视为错误。
    fn write_positions(&mut self, positions: &JointState) -> Result<(), BusError>;

    /// 打开或关闭扭矩
    fn set_torque(&mut self, enabled: bool) -> Result<(), BusError>;
}

impl<B: ActuatorBus + ?Sized> ActuatorBus for Box<B> {
    fn kind(&self) -> BusKind {
        (**self).kind()
    }
    fn joint_ids(&self) -> Vec<u16> {
        (**self).joint_ids()
    }
    fn len(&self) -> usize {
        (**self).len()
    }
    fn probe(&mut self) -> Result<BTreeSet<u16>, BusError> {
        (**self).probe()
    }
    fn read_positions(&mut self) -> Result<JointState, BusError> {
        (**self).read_positions()
    }
    fn write_positions(&mut self, positions: &JointState) -> Result<(), BusError> {
        (**self).write_positions(positions)
    }
    fn set_torque(&mut self, enabled: bool) -> Result<(), BusError> {
        (**self).set_torque(enabled)
    }
}

/// 探测结果中缺失的 ID
pub fn missing_ids(expected: &[u16], present: &BTreeSet<u16>) -> Vec<u16> {
    expected.iter().copied().filter(|id| !present.contains(id)).collect()
}
