//! USB 转 CAN 串口桥的帧格式
//!
//! 发送（主机 → 桥）：30 字节定长帧
//!
//! ```text
//! [0]  0x55  [1] 0xAA  [2] 0x1E  [3] 0x03  [4] 0x01  [5..8] 0
//! [8]  0x0A  [9..13] 0
//! [13..17] CAN ID（小端）
//! [17] 0x00  [18] DLC(0x08)  [19..21] 0
//! [21..29] 数据
//! [29] 0x00
//! ```
//!
//! 接收（桥 → 主机）：16 字节定长帧
//!
//! ```text
//! [0] 0xAA  [1] CMD  [2] DLC  [3..7] CAN ID（小端）  [7..15] 数据  [15] 0x55
//! ```
//!
//! `CMD == 0x11` 表示收到一帧 CAN 数据。

use crate::CanFrame;

/// 发送帧长度
pub const TX_FRAME_LEN: usize = 30;

/// 接收帧长度
pub const RX_FRAME_LEN: usize = 16;

/// 接收帧头
pub const RX_HEADER: u8 = 0xAA;

/// 接收帧尾
pub const RX_TAIL: u8 = 0x55;

/// 接收命令：CAN 数据
pub const CMD_CAN_RECEIVE: u8 = 0x11;

const TX_TEMPLATE: [u8; TX_FRAME_LEN] = [
    0x55, 0xAA, 0x1E, 0x03, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0,
    0x00, 0x08, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0x00,
];

const TX_ID_OFFSET: usize = 13;
const TX_DATA_OFFSET: usize = 21;

/// 编码发送帧
pub fn encode_tx(frame: &CanFrame) -> [u8; TX_FRAME_LEN] {
    let mut out = TX_TEMPLATE;
    out[TX_ID_OFFSET..TX_ID_OFFSET + 4].copy_from_slice(&frame.id.to_le_bytes());
    out[TX_DATA_OFFSET..TX_DATA_OFFSET + 8].copy_from_slice(&frame.data);
    out
}

/// 解码发送帧（用于模拟桥）
pub fn decode_tx(bytes: &[u8]) -> Option<CanFrame> {
    if bytes.len() != TX_FRAME_LEN || bytes[..5] != TX_TEMPLATE[..5] {
        return None;
    }
    let id = u32::from_le_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]);
    let data = &bytes[TX_DATA_OFFSET..TX_DATA_OFFSET + 8];
    Some(if id > 0x7FF {
        CanFrame::new_extended(id, data)
    } else {
        CanFrame::new_standard(id as u16, data)
    })
}

/// 编码接收帧（用于模拟桥）
pub fn encode_rx(frame: &CanFrame) -> [u8; RX_FRAME_LEN] {
    let mut out = [0u8; RX_FRAME_LEN];
    out[0] = RX_HEADER;
    out[1] = CMD_CAN_RECEIVE;
    out[2] = frame.len;
    out[3..7].copy_from_slice(&frame.id.to_le_bytes());
    out[7..15].copy_from_slice(&frame.data);
    out[15] = RX_TAIL;
    out
}

/// 桥上报的一个包
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgePacket {
    pub cmd: u8,
    pub frame: CanFrame,
}

/// 接收帧流式解码器
///
/// 以 `AA .. 55` 定长 16 字节为界切分；不满一帧的尾部留到下次。
#[derive(Debug, Default)]
pub struct RxDecoder {
    remainder: Vec<u8>,
}

impl RxDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加字节并取出所有完整的包
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<BridgePacket>) {
        self.remainder.extend_from_slice(bytes);
        let data = &self.remainder;
        let mut i = 0;
        let mut consumed = 0;
        while i + RX_FRAME_LEN <= data.len() {
            if data[i] == RX_HEADER && data[i + RX_FRAME_LEN - 1] == RX_TAIL {
                let packet = &data[i..i + RX_FRAME_LEN];
                let id = u32::from_le_bytes([packet[3], packet[4], packet[5], packet[6]]);
                let payload = &packet[7..15];
                let frame = if id > 0x7FF {
                    CanFrame::new_extended(id, payload)
                } else {
                    CanFrame::new_standard(id as u16, payload)
                };
                out.push(BridgePacket {
                    cmd: packet[1],
                    frame,
                });
                i += RX_FRAME_LEN;
                consumed = i;
            } else {
                i += 1;
            }
        }
        // 无法构成完整帧的前缀噪声也一并丢弃，只保留最后一个可能的帧起点
        let keep_from = if consumed > 0 {
            consumed
        } else {
            data.len().saturating_sub(RX_FRAME_LEN - 1)
        };
        self.remainder.drain(..keep_from);
    }

    pub fn pending(&self) -> usize {
        self.remainder.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_layout() {
        let frame = CanFrame::new_standard(0x0102, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let bytes = encode_tx(&frame);
        assert_eq!(&bytes[..5], &[0x55, 0xAA, 0x1E, 0x03, 0x01]);
        assert_eq!(bytes[8], 0x0A);
        assert_eq!(bytes[13], 0x02);
        assert_eq!(bytes[14], 0x01);
        assert_eq!(bytes[18], 0x08);
        assert_eq!(&bytes[21..29], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[29], 0x00);
        assert_eq!(decode_tx(&bytes), Some(frame));
    }

    #[test]
    fn test_rx_decoder_split_and_noise() {
        let a = encode_rx(&CanFrame::new_standard(0x11, &[9; 8]));
        let b = encode_rx(&CanFrame::new_extended(0xFF00, &[0, 1, 8, 0, 0, 0, 0, 0]));

        let mut stream = vec![0x00, 0x42];
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut decoder = RxDecoder::new();
        let mut out = Vec::new();
        decoder.feed(&stream[..20], &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cmd, CMD_CAN_RECEIVE);
        assert_eq!(out[0].frame.id, 0x11);

        decoder.feed(&stream[20..], &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].frame.id, 0xFF00);
        assert!(out[1].frame.is_extended);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_rx_decoder_bounds_garbage() {
        let mut decoder = RxDecoder::new();
        let mut out = Vec::new();
        decoder.feed(&[0x01; 100], &mut out);
        assert!(out.is_empty());
        assert!(decoder.pending() < RX_FRAME_LEN);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // 帧头之前的噪声和任意切分点都不影响解出的帧
            #[test]
            fn rx_decoder_resyncs_after_noise(
                noise in prop::collection::vec(0u8..0xAA, 0..40),
                id in 0u16..=0x7FF,
                data in prop::array::uniform8(any::<u8>()),
                split in 0usize..80,
            ) {
                let frame = CanFrame::new_standard(id, &data);
                let mut stream = noise;
                stream.extend_from_slice(&encode_rx(&frame));
                let split = split.min(stream.len());

                let mut decoder = RxDecoder::new();
                let mut out = Vec::new();
                decoder.feed(&stream[..split], &mut out);
                decoder.feed(&stream[split..], &mut out);

                prop_assert_eq!(out.len(), 1);
                prop_assert_eq!(out[0].frame, frame);
                prop_assert_eq!(decoder.pending(), 0);
            }
        }
    }
}
