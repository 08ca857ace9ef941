//! 串口传输
//!
//! - [`SerialLink`]：字节流抽象（真实串口或测试桩）
//! - [`SerialPortLink`]：基于 `serialport` 的实现
//! - [`SerialCanAdapter`]：USB 转 CAN 串口桥上的 [`CanAdapter`]

use crate::{CanAdapter, CanError, CanFrame};
use openk_protocol::bridge::{self, BridgePacket, RxDecoder};
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};
use tracing::trace;

/// 串口字节流
pub trait SerialLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// 读取已到达的字节，最多等待 `timeout`；超时返回 `Ok(0)`
    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// 丢弃输入缓冲中的残留字节
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<L: SerialLink + ?Sized> SerialLink for Box<L> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }
    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read_some(buf, timeout)
    }
    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }
}

/// 真实串口
#[cfg(feature = "serial")]
pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
    current_timeout: Duration,
}

#[cfg(feature = "serial")]
impl SerialPortLink {
    /// 打开串口
    ///
    /// # 参数
    /// - `path`: 设备路径（如 `/dev/ttyUSB0`）
    /// - `baud_rate`: 波特率（STS 默认 1_000_000，USB-CAN 桥默认 921_600）
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let current_timeout = Duration::from_millis(10);
        let port = serialport::new(path, baud_rate)
            .timeout(current_timeout)
            .open()
            .map_err(io::Error::from)?;
        tracing::info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self {
            port,
            current_timeout,
        })
    }
}

#[cfg(feature = "serial")]
impl SerialLink for SerialPortLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, bytes)?;
        io::Write::flush(&mut self.port)
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        // 零超时在部分平台上表示永久阻塞
        let timeout = timeout.max(Duration::from_millis(1));
        if timeout != self.current_timeout {
            self.port.set_timeout(timeout).map_err(io::Error::from)?;
            self.current_timeout = timeout;
        }
        match io::Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(0)
            },
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// USB 转 CAN 串口桥适配器
pub struct SerialCanAdapter<L: SerialLink> {
    link: L,
    decoder: RxDecoder,
    packets: Vec<BridgePacket>,
    queue: VecDeque<CanFrame>,
    read_timeout: Duration,
    buf: Box<[u8; 512]>,
    epoch: Instant,
}

impl<L: SerialLink> SerialCanAdapter<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            decoder: RxDecoder::new(),
            packets: Vec::new(),
            queue: VecDeque::new(),
            read_timeout: Duration::from_millis(2),
            buf: Box::new([0u8; 512]),
            epoch: Instant::now(),
        }
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn pump(&mut self, timeout: Duration) -> Result<(), CanError> {
        let n = self.link.read_some(&mut self.buf[..], timeout)?;
        if n == 0 {
            return Ok(());
        }
        self.decoder.feed(&self.buf[..n], &mut self.packets);
        let timestamp_us = self.epoch.elapsed().as_micros() as u64;
        for packet in self.packets.drain(..) {
            if packet.cmd == bridge::CMD_CAN_RECEIVE {
                let mut frame = packet.frame;
                frame.timestamp_us = timestamp_us;
                self.queue.push_back(frame);
            } else {
                trace!("Ignoring bridge packet with cmd 0x{:02X}", packet.cmd);
            }
        }
        Ok(())
    }
}

impl<L: SerialLink> CanAdapter for SerialCanAdapter<L> {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        self.link.write_all(&bridge::encode_tx(&frame))?;
        trace!("Sent CAN frame via bridge: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    fn receive(&mut self) -> Result<CanFrame, CanError> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(frame);
            }
            let now = Instant::now();
            self.pump(deadline.saturating_duration_since(now))?;
            if self.queue.is_empty() && Instant::now() >= deadline {
                return Err(CanError::Timeout);
            }
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BridgeLoopback, MockDamiaoAdapter};
    use crate::{ActuatorBus, DamiaoBus, DamiaoControlMode, DamiaoMotor, FaultPolicy};
    use openk_protocol::JointState;
    use openk_protocol::damiao::DamiaoModel;

    #[test]
    fn test_send_writes_bridge_frame() {
        let motors = [DamiaoMotor::new(DamiaoModel::Dm4310, 0x01, 0x11)];
        let link = BridgeLoopback::new(MockDamiaoAdapter::new(&motors));
        let mut adapter = SerialCanAdapter::new(link.clone());

        adapter
            .send(CanFrame::new_standard(0x7FF, &[0x01, 0x00, 0xCC, 0, 0, 0, 0, 0]))
            .unwrap();
        let written = link.written();
        assert_eq!(written.len(), bridge::TX_FRAME_LEN);
        assert_eq!(written[13], 0xFF);
        assert_eq!(written[14], 0x07);
    }

    #[test]
    fn test_receive_times_out_when_idle() {
        let motors = [DamiaoMotor::new(DamiaoModel::Dm4310, 0x01, 0x11)];
        let link = BridgeLoopback::new(MockDamiaoAdapter::new(&motors));
        let mut adapter = SerialCanAdapter::new(link);
        assert!(matches!(
            adapter.receive_timeout(Duration::ZERO),
            Err(CanError::Timeout)
        ));
        assert!(adapter.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_damiao_bus_over_bridge() {
        let motors = vec![
            DamiaoMotor::new(DamiaoModel::Dm6006, 0x01, 0x15),
            DamiaoMotor::new(DamiaoModel::Dm4310, 0x03, 0x15),
        ];
        let motor_fake = MockDamiaoAdapter::new(&motors);
        motor_fake.set_position(0x03, 2.0);
        let adapter = SerialCanAdapter::new(BridgeLoopback::new(motor_fake.clone()));
        let mut bus = DamiaoBus::new(
            adapter,
            motors,
            DamiaoControlMode::default(),
            FaultPolicy::default(),
        );

        let state = bus.read_positions().unwrap();
        assert!((state.positions[1] - 2.0).abs() < 1e-3);

        bus.set_torque(true).unwrap();
        bus.write_positions(&JointState::from_positions([0.25, -0.25]))
            .unwrap();
        assert!((motor_fake.position(0x01) - 0.25).abs() < 1e-3);
    }
}
