//! # OpenK Protocol
//!
//! 主从机械臂所用执行器总线的协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `joint`: 关节状态向量与关节名称布局
//! - `damiao`: 达妙（Damiao）多圈电机 CAN 协议（MIT / 位置速度 / 特殊指令 / 反馈）
//! - `sts`: 飞特 STS 串行舵机协议（数据包编码、校验、流式解析）
//! - `bridge`: USB 转 CAN 串口桥的帧格式
//!
//! ## 字节序
//!
//! - 达妙 MIT 帧按位打包，高位在前（大端）。
//! - 达妙位置速度帧使用小端 `f32`。
//! - STS 寄存器值为小端（低字节在前）。

pub mod bridge;
pub mod damiao;
pub mod joint;
pub mod sts;

pub use joint::{JointLayout, JointState, JointValues};

use thiserror::Error;

/// CAN 2.0 帧的统一抽象
///
/// 协议层和传输层之间的中间类型：
///
/// ```text
/// Protocol Layer (openk-protocol)
///     ↓ encode() 构建 / decode() 解析
/// CanFrame (此类型)
///     ↓ SocketCAN / 串口桥
/// Hardware
/// ```
///
/// 固定 8 字节数据，`Copy`，无堆分配。
///
/// ```rust
/// use openk_protocol::CanFrame;
///
/// let frame = CanFrame::new_standard(0x123, &[1, 2, 3, 4]);
/// assert_eq!(frame.id(), 0x123);
/// assert_eq!(frame.data_slice(), &[1, 2, 3, 4]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanFrame {
    /// CAN ID（标准帧或扩展帧）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,

    /// 接收时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl CanFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id, data, true)
    }

    fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed = [0u8; 8];
        let len = data.len().min(8);
        fixed[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed,
            len: len as u8,
            is_extended,
            timestamp_us: 0,
        }
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidCanId { id: u32 },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: &'static str, value: u32 },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    #[error("Bad packet header")]
    BadHeader,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_standard_truncates_to_eight_bytes() {
        let frame = CanFrame::new_standard(0x7FF, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!frame.is_extended);
    }

    #[test]
    fn test_new_extended() {
        let frame = CanFrame::new_extended(0x1234_5678, &[0xAA]);
        assert_eq!(frame.id(), 0x1234_5678);
        assert_eq!(frame.data_slice(), &[0xAA]);
        assert!(frame.is_extended);
        assert_eq!(frame.timestamp_us, 0);
    }
}
