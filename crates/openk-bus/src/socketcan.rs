//! SocketCAN 适配器（仅 Linux）
//!
//! 波特率等配置由系统工具（`ip link`）完成，不在应用层设置。

use crate::{CanAdapter, CanError, CanFrame};
use socketcan::{
    CanFrame as RawFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId,
};
use std::io;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// SocketCAN 适配器
///
/// ```no_run
/// use openk_bus::{CanAdapter, CanFrame, SocketCanAdapter};
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
/// adapter.send(CanFrame::new_standard(0x7FF, &[0x01, 0x00, 0xCC])).unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
    epoch: Instant,
}

impl SocketCanAdapter {
    /// 打开 CAN 接口
    ///
    /// # 错误
    /// - `CanError::Device`: 接口不存在或无法打开
    /// - `CanError::Io`: 设置超时失败
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();
        let socket = CanSocket::open(&interface).map_err(|e| {
            CanError::Device(format!(
                "Failed to open CAN interface '{}': {}. Is it up? Try:\n  sudo ip link set {} up type can bitrate 1000000",
                interface, e, interface
            ))
        })?;

        let read_timeout = Duration::from_millis(2);
        socket.set_read_timeout(read_timeout)?;
        trace!("SocketCAN interface '{}' opened", interface);

        Ok(Self {
            socket,
            interface,
            read_timeout,
            epoch: Instant::now(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        // 零超时会让 socket 永久阻塞
        let timeout = timeout.max(Duration::from_micros(100));
        if timeout != self.read_timeout {
            self.socket.set_read_timeout(timeout)?;
            self.read_timeout = timeout;
        }
        Ok(())
    }
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        let raw = if frame.is_extended {
            ExtendedId::new(frame.id).and_then(|id| RawFrame::new(id, frame.data_slice()))
        } else {
            StandardId::new(frame.id as u16).and_then(|id| RawFrame::new(id, frame.data_slice()))
        }
        .ok_or_else(|| CanError::Device(format!("Invalid CAN frame ID 0x{:X}", frame.id)))?;

        self.socket.write_frame(&raw)?;
        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    fn receive(&mut self) -> Result<CanFrame, CanError> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let raw = match self.socket.read_frame() {
                Ok(raw) => raw,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Err(CanError::Timeout);
                },
                Err(e) => return Err(CanError::Io(e)),
            };

            if let RawFrame::Error(err) = &raw {
                warn!("CAN error frame on '{}': {:?}", self.interface, err);
                if Instant::now() >= deadline {
                    return Err(CanError::Timeout);
                }
                continue;
            }

            let data = raw.data();
            let mut frame = if raw.is_extended() {
                CanFrame::new_extended(raw.raw_id() & 0x1FFF_FFFF, data)
            } else {
                CanFrame::new_standard((raw.raw_id() & 0x7FF) as u16, data)
            };
            frame.timestamp_us = self.epoch.elapsed().as_micros() as u64;
            trace!("Received CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
            return Ok(frame);
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.apply_timeout(timeout) {
            warn!("Failed to set receive timeout: {}", e);
        }
    }
}
