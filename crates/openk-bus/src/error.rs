//! 总线层错误类型定义

use crate::{BusKind, CanError};
use openk_protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// 总线层错误类型
#[derive(Error, Debug)]
pub enum BusError {
    /// CAN 传输错误
    #[error("CAN transport error: {0}")]
    Can(#[from] CanError),

    /// 串口 IO 错误
    #[error("Serial IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 协议错误（非单个坏包，而是无法继续的格式问题）
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 执行器在重试后仍未应答
    #[error("{bus} actuator {id} did not reply after {attempts} attempts")]
    Timeout { bus: BusKind, id: u16, attempts: u32 },

    /// 滚动窗口内坏包过多
    #[error("{bus} bus: {count} malformed replies within {window:?}")]
    Malformed {
        bus: BusKind,
        count: u32,
        window: Duration,
    },

    /// 关节向量长度与总线不一致
    #[error("Joint vector length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// 目标值不是有限数
    #[error("Non-finite command for actuator {id}")]
    NonFinite { id: u16 },
}

impl BusError {
    /// 设备已经不可用，重试没有意义
    pub fn is_fatal(&self) -> bool {
        match self {
            BusError::Can(e) => e.is_fatal(),
            BusError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// 单次超时（可在同一周期内重试）
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BusError::Timeout { .. } | BusError::Can(CanError::Timeout)
        ) || matches!(self, BusError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = BusError::Timeout {
            bus: BusKind::Sts,
            id: 3,
            attempts: 3,
        };
        assert_eq!(err.to_string(), "sts actuator 3 did not reply after 3 attempts");

        let err = BusError::Malformed {
            bus: BusKind::Damiao,
            count: 11,
            window: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("11 malformed replies"));
    }

    #[test]
    fn test_classification() {
        let timeout = BusError::Timeout {
            bus: BusKind::Damiao,
            id: 1,
            attempts: 2,
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_fatal());

        let gone = BusError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(gone.is_fatal());
        assert!(BusError::Can(CanError::BusOff).is_fatal());
        assert!(!BusError::LengthMismatch { expected: 5, actual: 4 }.is_fatal());
    }
}
