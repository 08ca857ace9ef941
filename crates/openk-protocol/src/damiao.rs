//! 达妙（Damiao）多圈电机 CAN 协议
//!
//! 每个电机有一个命令 ID（slave id）和一个反馈 ID（master id）。
//! 控制帧有两种：MIT 帧（位、速、kp、kd、力矩按位打包）与位置速度帧（两个小端 `f32`）。

use crate::{CanFrame, ProtocolError};

/// 位置速度模式帧 ID 偏移
pub const POS_VEL_ID_OFFSET: u16 = 0x100;

/// 状态刷新请求帧 ID
pub const REFRESH_ID: u16 = 0x7FF;

/// MIT 模式 kp 上限
pub const KP_MAX: f32 = 500.0;

/// MIT 模式 kd 上限
pub const KD_MAX: f32 = 5.0;

// ============================================================================
// 电机型号与量程
// ============================================================================

/// 电机型号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum DamiaoModel {
    Dm4310,
    Dm4340,
    Dm6006,
    Dm8006,
    Dm8009,
    Dm10010,
}

/// 电机量程：位置（rad）、速度（rad/s）、力矩（N·m）的对称上限
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorLimits {
    pub p_max: f32,
    pub v_max: f32,
    pub t_max: f32,
}

impl DamiaoModel {
    /// 型号对应的固件量程（与电机出厂参数一致）
    pub const fn limits(self) -> MotorLimits {
        let (p_max, v_max, t_max) = match self {
            DamiaoModel::Dm4310 => (12.5, 30.0, 10.0),
            DamiaoModel::Dm4340 => (12.5, 8.0, 28.0),
            DamiaoModel::Dm6006 => (12.5, 45.0, 20.0),
            DamiaoModel::Dm8006 => (12.5, 45.0, 40.0),
            DamiaoModel::Dm8009 => (12.5, 45.0, 54.0),
            DamiaoModel::Dm10010 => (12.5, 20.0, 200.0),
        };
        MotorLimits {
            p_max,
            v_max,
            t_max,
        }
    }
}

/// 浮点 → 定点（先截断到 `[min, max]`）
pub fn float_to_uint(x: f32, min: f32, max: f32, bits: u32) -> u16 {
    let x = x.clamp(min, max);
    let span = max - min;
    let scale = ((1u32 << bits) - 1) as f32;
    (((x - min) / span) * scale) as u16
}

/// 定点 → 浮点
pub fn uint_to_float(x: u16, min: f32, max: f32, bits: u32) -> f32 {
    let span = max - min;
    let scale = ((1u32 << bits) - 1) as f32;
    (x as f32 / scale) * span + min
}

// ============================================================================
// 特殊指令
// ============================================================================

/// 特殊指令：数据为 `FF×7` 加一个指令字节，发往命令 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum SpecialCommand {
    /// 清除错误
    ClearError = 0xFB,
    /// 使能
    Enable = 0xFC,
    /// 失能
    Disable = 0xFD,
    /// 将当前位置设为零点
    SaveZero = 0xFE,
}

impl SpecialCommand {
    pub fn to_frame(self, slave_id: u16) -> CanFrame {
        let mut data = [0xFFu8; 8];
        data[7] = self.into();
        CanFrame::new_standard(slave_id, &data)
    }

    /// 解析特殊指令帧
    pub fn from_frame(frame: &CanFrame) -> Option<Self> {
        let data = frame.data_slice();
        if data.len() != 8 || data[..7].iter().any(|&b| b != 0xFF) {
            return None;
        }
        Self::try_from(data[7]).ok()
    }
}

/// 状态刷新请求：电机收到后在反馈 ID 上回一帧状态
pub fn refresh_frame(slave_id: u16) -> CanFrame {
    let [lo, hi] = slave_id.to_le_bytes();
    CanFrame::new_standard(REFRESH_ID, &[lo, hi, 0xCC, 0, 0, 0, 0, 0])
}

/// 解析刷新请求帧，返回目标命令 ID
pub fn parse_refresh(frame: &CanFrame) -> Option<u16> {
    let data = frame.data_slice();
    if frame.id != REFRESH_ID as u32 || data.len() < 3 || data[2] != 0xCC {
        return None;
    }
    Some(u16::from_le_bytes([data[0], data[1]]))
}

// ============================================================================
// 控制帧
// ============================================================================

/// MIT 控制指令
///
/// 打包布局（高位在前）：`p[16] v[12] kp[12] kd[12] t[12]`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MitCommand {
    pub position: f32,
    pub velocity: f32,
    pub kp: f32,
    pub kd: f32,
    pub torque: f32,
}

impl MitCommand {
    /// 纯位置跟踪（速度与前馈力矩为 0）
    pub fn position(position: f32, kp: f32, kd: f32) -> Self {
        Self {
            position,
            velocity: 0.0,
            kp,
            kd,
            torque: 0.0,
        }
    }

    pub fn to_frame(&self, slave_id: u16, limits: MotorLimits) -> CanFrame {
        let p = float_to_uint(self.position, -limits.p_max, limits.p_max, 16);
        let v = float_to_uint(self.velocity, -limits.v_max, limits.v_max, 12);
        let kp = float_to_uint(self.kp, 0.0, KP_MAX, 12);
        let kd = float_to_uint(self.kd, 0.0, KD_MAX, 12);
        let t = float_to_uint(self.torque, -limits.t_max, limits.t_max, 12);

        let data = [
            (p >> 8) as u8,
            (p & 0xFF) as u8,
            (v >> 4) as u8,
            (((v & 0xF) << 4) | (kp >> 8)) as u8,
            (kp & 0xFF) as u8,
            (kd >> 4) as u8,
            (((kd & 0xF) << 4) | (t >> 8)) as u8,
            (t & 0xFF) as u8,
        ];
        CanFrame::new_standard(slave_id, &data)
    }

    /// 解码 MIT 帧（量化后的值）
    pub fn from_frame(frame: &CanFrame, limits: MotorLimits) -> Result<Self, ProtocolError> {
        let d = frame.data_slice();
        if d.len() != 8 {
            return Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: d.len(),
            });
        }
        let p = ((d[0] as u16) << 8) | d[1] as u16;
        let v = ((d[2] as u16) << 4) | (d[3] >> 4) as u16;
        let kp = (((d[3] & 0xF) as u16) << 8) | d[4] as u16;
        let kd = ((d[5] as u16) << 4) | (d[6] >> 4) as u16;
        let t = (((d[6] & 0xF) as u16) << 8) | d[7] as u16;
        Ok(Self {
            position: uint_to_float(p, -limits.p_max, limits.p_max, 16),
            velocity: uint_to_float(v, -limits.v_max, limits.v_max, 12),
            kp: uint_to_float(kp, 0.0, KP_MAX, 12),
            kd: uint_to_float(kd, 0.0, KD_MAX, 12),
            torque: uint_to_float(t, -limits.t_max, limits.t_max, 12),
        })
    }
}

/// 位置速度控制指令（帧 ID = `0x100 + slave_id`）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosVelCommand {
    pub position: f32,
    pub velocity: f32,
}

impl PosVelCommand {
    pub fn to_frame(&self, slave_id: u16) -> CanFrame {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&self.position.to_le_bytes());
        data[4..].copy_from_slice(&self.velocity.to_le_bytes());
        CanFrame::new_standard(POS_VEL_ID_OFFSET + slave_id, &data)
    }

    pub fn from_frame(frame: &CanFrame) -> Result<Self, ProtocolError> {
        let d = frame.data_slice();
        if d.len() != 8 {
            return Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: d.len(),
            });
        }
        Ok(Self {
            position: f32::from_le_bytes([d[0], d[1], d[2], d[3]]),
            velocity: f32::from_le_bytes([d[4], d[5], d[6], d[7]]),
        })
    }
}

// ============================================================================
// 反馈帧
// ============================================================================

/// 电机状态码（反馈帧 d0 高 4 位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::FromPrimitive)]
#[repr(u8)]
pub enum MotorState {
    #[default]
    Disabled = 0x0,
    Enabled = 0x1,
    OverVoltage = 0x8,
    UnderVoltage = 0x9,
    OverCurrent = 0xA,
    MosOverTemperature = 0xB,
    RotorOverTemperature = 0xC,
    LostCommunication = 0xD,
    Overload = 0xE,
}

impl MotorState {
    /// 状态码 ≥ 8 为故障
    pub fn is_fault(self) -> bool {
        (self as u8) >= 0x8
    }
}

/// 电机反馈
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamiaoFeedback {
    /// d0 低 4 位（命令 ID 的低位）
    pub motor_id: u8,
    pub state: MotorState,
    pub position: f32,
    pub velocity: f32,
    pub torque: f32,
    /// MOS 温度（℃）
    pub t_mos: u8,
    /// 转子温度（℃）
    pub t_rotor: u8,
}

impl DamiaoFeedback {
    pub fn decode(frame: &CanFrame, limits: MotorLimits) -> Result<Self, ProtocolError> {
        let d = frame.data_slice();
        if d.len() != 8 {
            return Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: d.len(),
            });
        }
        let p = ((d[1] as u16) << 8) | d[2] as u16;
        let v = ((d[3] as u16) << 4) | (d[4] >> 4) as u16;
        let t = (((d[4] & 0xF) as u16) << 8) | d[5] as u16;
        Ok(Self {
            motor_id: d[0] & 0x0F,
            state: MotorState::from(d[0] >> 4),
            position: uint_to_float(p, -limits.p_max, limits.p_max, 16),
            velocity: uint_to_float(v, -limits.v_max, limits.v_max, 12),
            torque: uint_to_float(t, -limits.t_max, limits.t_max, 12),
            t_mos: d[6],
            t_rotor: d[7],
        })
    }

    /// 编码为反馈帧（用于模拟电机）
    pub fn encode(&self, master_id: u16, limits: MotorLimits) -> CanFrame {
        let p = float_to_uint(self.position, -limits.p_max, limits.p_max, 16);
        let v = float_to_uint(self.velocity, -limits.v_max, limits.v_max, 12);
        let t = float_to_uint(self.torque, -limits.t_max, limits.t_max, 12);
        let data = [
            ((self.state as u8) << 4) | (self.motor_id & 0x0F),
            (p >> 8) as u8,
            (p & 0xFF) as u8,
            (v >> 4) as u8,
            (((v & 0xF) << 4) | (t >> 8)) as u8,
            (t & 0xFF) as u8,
            self.t_mos,
            self.t_rotor,
        ];
        CanFrame::new_standard(master_id, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DM4310: MotorLimits = DamiaoModel::Dm4310.limits();

    #[test]
    fn test_special_command_frames() {
        let frame = SpecialCommand::Enable.to_frame(0x03);
        assert_eq!(frame.id, 0x03);
        assert_eq!(frame.data, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFC]);
        assert_eq!(SpecialCommand::from_frame(&frame), Some(SpecialCommand::Enable));

        let frame = SpecialCommand::SaveZero.to_frame(0x01);
        assert_eq!(frame.data[7], 0xFE);

        let not_special = CanFrame::new_standard(0x01, &[0; 8]);
        assert_eq!(SpecialCommand::from_frame(&not_special), None);
    }

    #[test]
    fn test_refresh_frame() {
        let frame = refresh_frame(0x0105);
        assert_eq!(frame.id, 0x7FF);
        assert_eq!(&frame.data[..3], &[0x05, 0x01, 0xCC]);
        assert_eq!(parse_refresh(&frame), Some(0x0105));
    }

    #[test]
    fn test_mit_zero_command_layout() {
        // 零位置、零速度、零力矩对应量程中点
        let frame = MitCommand::position(0.0, 0.0, 0.0).to_frame(0x02, DM4310);
        assert_eq!(frame.id, 0x02);
        assert_eq!(frame.data[0], 0x7F);
        assert_eq!(frame.data[1], 0xFF);
        assert_eq!(frame.data[2], 0x7F);
        assert_eq!(frame.data[3] >> 4, 0xF);
    }

    #[test]
    fn test_mit_decode_quantization_error() {
        let cmd = MitCommand {
            position: 1.234,
            velocity: -2.5,
            kp: 20.0,
            kd: 1.0,
            torque: 0.75,
        };
        let decoded = MitCommand::from_frame(&cmd.to_frame(0x01, DM4310), DM4310).unwrap();
        assert!((decoded.position - cmd.position).abs() < 25.0 / 65535.0 * 2.0);
        assert!((decoded.velocity - cmd.velocity).abs() < 60.0 / 4095.0 * 2.0);
        assert!((decoded.kp - cmd.kp).abs() < 500.0 / 4095.0 * 2.0);
        assert!((decoded.kd - cmd.kd).abs() < 5.0 / 4095.0 * 2.0);
        assert!((decoded.torque - cmd.torque).abs() < 20.0 / 4095.0 * 2.0);
    }

    #[test]
    fn test_mit_out_of_range_clamps() {
        let frame = MitCommand::position(100.0, 0.0, 0.0).to_frame(0x01, DM4310);
        assert_eq!(frame.data[0], 0xFF);
        assert_eq!(frame.data[1], 0xFF);
    }

    #[test]
    fn test_pos_vel_frame() {
        let cmd = PosVelCommand {
            position: 1.5,
            velocity: 2.0,
        };
        let frame = cmd.to_frame(0x04);
        assert_eq!(frame.id, 0x104);
        assert_eq!(&frame.data[..4], &1.5f32.to_le_bytes());
        assert_eq!(PosVelCommand::from_frame(&frame).unwrap(), cmd);
    }

    #[test]
    fn test_feedback_decode() {
        let feedback = DamiaoFeedback {
            motor_id: 0x3,
            state: MotorState::Enabled,
            position: -3.0,
            velocity: 0.0,
            torque: 0.0,
            t_mos: 35,
            t_rotor: 40,
        };
        let frame = feedback.encode(0x13, DM4310);
        let decoded = DamiaoFeedback::decode(&frame, DM4310).unwrap();
        assert_eq!(decoded.motor_id, 0x3);
        assert_eq!(decoded.state, MotorState::Enabled);
        assert!((decoded.position + 3.0).abs() < 1e-3);
        assert_eq!(decoded.t_mos, 35);
        assert_eq!(decoded.t_rotor, 40);
    }

    #[test]
    fn test_feedback_fault_state() {
        let frame = CanFrame::new_standard(0x11, &[0xB1, 0x7F, 0xFF, 0x7F, 0xF7, 0xFF, 80, 60]);
        let decoded = DamiaoFeedback::decode(&frame, DM4310).unwrap();
        assert_eq!(decoded.state, MotorState::MosOverTemperature);
        assert!(decoded.state.is_fault());
        assert!(!MotorState::Enabled.is_fault());
    }

    #[test]
    fn test_feedback_short_frame() {
        let frame = CanFrame::new_standard(0x11, &[0x01, 0x02]);
        assert!(matches!(
            DamiaoFeedback::decode(&frame, DM4310),
            Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_unknown_state_code_maps_to_default() {
        assert_eq!(MotorState::from(0x5), MotorState::Disabled);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // 量化误差不超过一个刻度
            #[test]
            fn quantization_error_within_one_step(x in -12.5f32..=12.5f32) {
                let (min, max, bits) = (-12.5f32, 12.5f32, 16);
                let step = (max - min) / ((1u32 << bits) - 1) as f32;
                let back = uint_to_float(float_to_uint(x, min, max, bits), min, max, bits);
                prop_assert!((back - x).abs() <= step * 1.01 + 1e-5, "x={} back={}", x, back);
            }

            #[test]
            fn out_of_range_values_saturate(x in 12.5f32..1000.0f32) {
                prop_assert_eq!(float_to_uint(x, -12.5, 12.5, 16), u16::MAX);
                prop_assert_eq!(float_to_uint(-x, -12.5, 12.5, 16), 0);
            }
        }
    }
}
