//! 飞特 STS 串行舵机协议
//!
//! 指令包：`FF FF ID LEN INSTR P1..Pn SUM`，应答包：`FF FF ID LEN ERR P1..Pn SUM`，
//! 其中 `LEN = n + 2`，`SUM = !(ID + LEN + INSTR/ERR + P1 + .. + Pn)`。
//! 寄存器值为小端（低字节在前）。

use crate::ProtocolError;
use smallvec::SmallVec;

/// 包头
pub const HEADER: [u8; 2] = [0xFF, 0xFF];

/// 广播 ID
pub const BROADCAST_ID: u8 = 0xFE;

/// 扭矩开关寄存器
pub const REG_TORQUE_ENABLE: u8 = 40;

/// 目标位置寄存器（2 字节）
pub const REG_GOAL_POSITION: u8 = 42;

/// 当前位置寄存器（2 字节）
pub const REG_PRESENT_POSITION: u8 = 56;

/// 一圈的位置分辨率上限（12 bit）
pub const POSITION_MAX: u16 = 4095;

/// 指令码
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

/// 校验和：除包头外所有字节求和后取反
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// 组装指令包
pub fn encode_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(params.len() + 6);
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push((params.len() + 2) as u8);
    packet.push(instruction.into());
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    packet
}

pub fn ping(id: u8) -> Vec<u8> {
    encode_packet(id, Instruction::Ping, &[])
}

pub fn read(id: u8, address: u8, len: u8) -> Vec<u8> {
    encode_packet(id, Instruction::Read, &[address, len])
}

pub fn write(id: u8, address: u8, data: &[u8]) -> Vec<u8> {
    let mut params = SmallVec::<[u8; 8]>::new();
    params.push(address);
    params.extend_from_slice(data);
    encode_packet(id, Instruction::Write, &params)
}

/// 同步读：一条广播指令，每个舵机按 ID 顺序各回一个应答包
pub fn sync_read(address: u8, len: u8, ids: &[u8]) -> Vec<u8> {
    let mut params = Vec::with_capacity(ids.len() + 2);
    params.push(address);
    params.push(len);
    params.extend_from_slice(ids);
    encode_packet(BROADCAST_ID, Instruction::SyncRead, &params)
}

/// 同步写：一条广播指令写多个舵机的同一寄存器段，无应答
pub fn sync_write(address: u8, data_len: u8, entries: &[(u8, &[u8])]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + entries.len() * (data_len as usize + 1));
    params.push(address);
    params.push(data_len);
    for (id, data) in entries {
        params.push(*id);
        params.extend_from_slice(data);
    }
    encode_packet(BROADCAST_ID, Instruction::SyncWrite, &params)
}

/// 同步写目标位置
pub fn sync_write_positions(targets: &[(u8, u16)]) -> Vec<u8> {
    let encoded: SmallVec<[(u8, [u8; 2]); 8]> =
        targets.iter().map(|&(id, pos)| (id, pos.to_le_bytes())).collect();
    let entries: SmallVec<[(u8, &[u8]); 8]> =
        encoded.iter().map(|(id, bytes)| (*id, bytes.as_slice())).collect();
    sync_write(REG_GOAL_POSITION, 2, &entries)
}

/// 当前位置解码：bit 15 为方向位（符号-幅值）
pub fn decode_position(raw: u16) -> i32 {
    let magnitude = (raw & 0x7FFF) as i32;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}

/// 当前位置编码（用于模拟舵机）
pub fn encode_position(value: i32) -> u16 {
    let magnitude = value.unsigned_abs().min(0x7FFF) as u16;
    if value < 0 { magnitude | 0x8000 } else { magnitude }
}

// ============================================================================
// 应答包解析
// ============================================================================

/// 应答包
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    /// 舵机错误位（0 表示正常）
    pub error: u8,
    pub params: SmallVec<[u8; 8]>,
}

impl StatusPacket {
    /// 组装应答包（用于模拟舵机）
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.params.len() + 6);
        packet.extend_from_slice(&HEADER);
        packet.push(self.id);
        packet.push((self.params.len() + 2) as u8);
        packet.push(self.error);
        packet.extend_from_slice(&self.params);
        packet.push(checksum(&packet[2..]));
        packet
    }

    /// 按小端解析 2 字节寄存器值
    pub fn word(&self) -> Result<u16, ProtocolError> {
        match self.params.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            other => Err(ProtocolError::InvalidLength {
                expected: 2,
                actual: other.len(),
            }),
        }
    }
}

/// 流式应答包解析器
///
/// 串口读到的字节可能在任意位置断开，也可能混入噪声。解析器保留未完成的尾部，
/// 在包头处重新同步；校验失败的包被丢弃并以 `Err` 报告一次。
#[derive(Debug, Default)]
pub struct PacketParser {
    buffer: Vec<u8>,
}

impl PacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加读到的字节
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 丢弃缓冲
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// 缓冲中尚未解析的字节数
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// 取出下一个完整的包
    ///
    /// - `None`：数据不足
    /// - `Some(Ok(_))`：有效包
    /// - `Some(Err(_))`：坏包（已丢弃）
    pub fn next_packet(&mut self) -> Option<Result<StatusPacket, ProtocolError>> {
        loop {
            let start = match self.buffer.windows(2).position(|w| w == HEADER) {
                Some(start) => start,
                None => {
                    // 保留末尾可能是半个包头的 0xFF
                    let keep = usize::from(self.buffer.last() == Some(&0xFF));
                    let drop = self.buffer.len() - keep;
                    self.buffer.drain(..drop);
                    return None;
                },
            };
            if start > 0 {
                self.buffer.drain(..start);
            }

            if self.buffer.len() < 4 {
                return None;
            }
            // FF FF FF ID：多余的 0xFF 属于噪声
            if self.buffer[2] == 0xFF {
                self.buffer.remove(0);
                continue;
            }
            let len = self.buffer[3] as usize;
            if len < 2 {
                self.buffer.drain(..2);
                return Some(Err(ProtocolError::InvalidLength {
                    expected: 2,
                    actual: len,
                }));
            }
            let total = 4 + len;
            if self.buffer.len() < total {
                return None;
            }

            let body = &self.buffer[2..total - 1];
            let expected = checksum(body);
            let actual = self.buffer[total - 1];
            if expected != actual {
                // 只跳过包头，之后的字节可能是下一个真包的开头
                self.buffer.drain(..2);
                return Some(Err(ProtocolError::Checksum { expected, actual }));
            }

            let packet = StatusPacket {
                id: self.buffer[2],
                error: self.buffer[4],
                params: SmallVec::from_slice(&self.buffer[5..total - 1]),
            };
            self.buffer.drain(..total);
            return Some(Ok(packet));
        }
    }
}

// ============================================================================
// CAN 网关（STS 控制器挂在 USB-CAN 桥上）
// ============================================================================

pub mod gateway {
    //! STS 控制器通过 CAN 转发舵机读写，请求与应答均使用 ID `0xFF00`。

    use crate::CanFrame;

    /// 网关 CAN ID
    pub const GATEWAY_ID: u32 = 0xFF00;

    /// 写目标位置：`[id_hi, id_lo, pos_hi, pos_lo, 0, 0xFF, 0, 0]`
    pub fn write_position_frame(motor_id: u16, position: u16) -> CanFrame {
        let [id_hi, id_lo] = motor_id.to_be_bytes();
        let [pos_hi, pos_lo] = position.to_be_bytes();
        CanFrame::new_extended(GATEWAY_ID, &[id_hi, id_lo, pos_hi, pos_lo, 0, 0xFF, 0, 0])
    }

    /// 读当前位置请求：`[id_hi, id_lo, 0, 0, 0xFF, 0, 0, 0]`
    pub fn read_position_frame(motor_id: u16) -> CanFrame {
        let [id_hi, id_lo] = motor_id.to_be_bytes();
        CanFrame::new_extended(GATEWAY_ID, &[id_hi, id_lo, 0, 0, 0xFF, 0, 0, 0])
    }

    /// 请求帧的种类
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GatewayRequest {
        Read { motor_id: u16 },
        Write { motor_id: u16, position: u16 },
    }

    /// 解析请求帧（用于模拟网关）
    pub fn parse_request(frame: &CanFrame) -> Option<GatewayRequest> {
        if frame.id & 0xFFFF != GATEWAY_ID || frame.len != 8 {
            return None;
        }
        let d = frame.data;
        let motor_id = u16::from_be_bytes([d[0], d[1]]);
        match (d[4], d[5]) {
            (0xFF, _) => Some(GatewayRequest::Read { motor_id }),
            (_, 0xFF) => Some(GatewayRequest::Write {
                motor_id,
                position: u16::from_be_bytes([d[2], d[3]]),
            }),
            _ => None,
        }
    }

    /// 应答帧：`[id_hi, id_lo, pos_hi, pos_lo, ..]`
    pub fn reply_frame(motor_id: u16, position: u16) -> CanFrame {
        let [id_hi, id_lo] = motor_id.to_be_bytes();
        let [pos_hi, pos_lo] = position.to_be_bytes();
        CanFrame::new_extended(GATEWAY_ID, &[id_hi, id_lo, pos_hi, pos_lo, 0, 0, 0, 0])
    }

    /// 解析应答帧，返回 `(舵机 ID, 位置)`
    pub fn parse_reply(frame: &CanFrame) -> Option<(u16, u16)> {
        if frame.id & 0xFFFF != GATEWAY_ID || frame.len < 4 {
            return None;
        }
        let d = frame.data;
        Some((u16::from_be_bytes([d[0], d[1]]), u16::from_be_bytes([d[2], d[3]])))
    }
}
