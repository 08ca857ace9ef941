//! STS 舵机总线
//!
//! [`StsBus`] 负责重试、坏包统计与目标值截断；具体的收发由 [`StsLink`] 完成：
//!
//! - [`TtlLink`]：TTL 串口直连菊花链，同步读 + 同步写
//! - [`CanGatewayLink`]：STS 控制器挂在 CAN 上，按舵机逐个转发

use crate::serial::SerialLink;
use crate::{ActuatorBus, BusError, BusKind, CanAdapter, CanError, FaultPolicy, JointState, MalformedWindow};
use openk_protocol::sts::{self, PacketParser, gateway};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 一次读取的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StsReadout {
    /// `(舵机 ID, 当前位置)`
    pub positions: SmallVec<[(u8, i32); 8]>,
    /// 丢弃的坏包数
    pub malformed: u32,
}

impl StsReadout {
    fn get(&self, id: u8) -> Option<i32> {
        self.positions.iter().find(|(i, _)| *i == id).map(|(_, p)| *p)
    }
}

/// STS 收发链路
pub trait StsLink {
    /// 读取多个舵机的当前位置（未应答的舵机不出现在结果中）
    fn read_positions(&mut self, ids: &[u8], timeout: Duration) -> Result<StsReadout, BusError>;

    /// 写入多个舵机的目标位置
    fn write_positions(&mut self, targets: &[(u8, u16)]) -> Result<(), BusError>;

    /// 舵机是否应答
    fn ping(&mut self, id: u8, timeout: Duration) -> Result<bool, BusError>;

    fn set_torque(&mut self, ids: &[u8], enabled: bool) -> Result<(), BusError>;
}

// ============================================================================
// TTL 串口链路
// ============================================================================

/// TTL 串口直连
pub struct TtlLink<L: SerialLink> {
    link: L,
    parser: PacketParser,
    buf: [u8; 256],
}

impl<L: SerialLink> TtlLink<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            parser: PacketParser::new(),
            buf: [0u8; 256],
        }
    }

    /// 发送请求后收集应答，直到 `ids` 全部应答或超时
    fn exchange(
        &mut self,
        request: &[u8],
        ids: &[u8],
        timeout: Duration,
    ) -> Result<(SmallVec<[sts::StatusPacket; 8]>, u32), BusError> {
        self.link.clear_input()?;
        self.parser.clear();
        self.link.write_all(request)?;

        let deadline = Instant::now() + timeout;
        let mut replies: SmallVec<[sts::StatusPacket; 8]> = SmallVec::new();
        let mut malformed = 0;
        loop {
            while let Some(result) = self.parser.next_packet() {
                match result {
                    Ok(packet) if ids.contains(&packet.id) => {
                        if packet.error != 0 {
                            warn!("STS servo {} reports error bits 0x{:02X}", packet.id, packet.error);
                        }
                        if !replies.iter().any(|p| p.id == packet.id) {
                            replies.push(packet);
                        }
                    },
                    // 半双工适配器会回显请求本身
                    Ok(packet) => trace!("Ignoring STS packet from id {}", packet.id),
                    Err(e) => {
                        trace!("Malformed STS reply: {}", e);
                        malformed += 1;
                    },
                }
            }
            if replies.len() == ids.len() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let n = self.link.read_some(&mut self.buf, deadline - now)?;
            self.parser.push(&self.buf[..n]);
        }
        Ok((replies, malformed))
    }
}

impl<L: SerialLink> StsLink for TtlLink<L> {
    fn read_positions(&mut self, ids: &[u8], timeout: Duration) -> Result<StsReadout, BusError> {
        let request = match ids {
            [id] => sts::read(*id, sts::REG_PRESENT_POSITION, 2),
            _ => sts::sync_read(sts::REG_PRESENT_POSITION, 2, ids),
        };
        let (replies, mut malformed) = self.exchange(&request, ids, timeout)?;

        let mut readout = StsReadout::default();
        for packet in replies {
            match packet.word() {
                Ok(raw) => readout.positions.push((packet.id, sts::decode_position(raw))),
                Err(_) => malformed += 1,
            }
        }
        readout.malformed = malformed;
        Ok(readout)
    }

    fn write_positions(&mut self, targets: &[(u8, u16)]) -> Result<(), BusError> {
        self.link.write_all(&sts::sync_write_positions(targets))?;
        Ok(())
    }

    fn ping(&mut self, id: u8, timeout: Duration) -> Result<bool, BusError> {
        let (replies, _) = self.exchange(&sts::ping(id), &[id], timeout)?;
        Ok(!replies.is_empty())
    }

    fn set_torque(&mut self, ids: &[u8], enabled: bool) -> Result<(), BusError> {
        let value = [u8::from(enabled)];
        let entries: SmallVec<[(u8, &[u8]); 8]> = ids.iter().map(|&id| (id, &value[..])).collect();
        self.link
            .write_all(&sts::sync_write(sts::REG_TORQUE_ENABLE, 1, &entries))?;
        Ok(())
    }
}

// ============================================================================
// CAN 网关链路
// ============================================================================

/// STS 控制器经 CAN 转发
pub struct CanGatewayLink<C: CanAdapter> {
    adapter: C,
}

impl<C: CanAdapter> CanGatewayLink<C> {
    pub fn new(adapter: C) -> Self {
        Self { adapter }
    }
}

impl<C: CanAdapter> StsLink for CanGatewayLink<C> {
    fn read_positions(&mut self, ids: &[u8], timeout: Duration) -> Result<StsReadout, BusError> {
        for &id in ids {
            self.adapter.send(gateway::read_position_frame(id as u16))?;
        }

        let deadline = Instant::now() + timeout;
        let mut readout = StsReadout::default();
        while readout.positions.len() < ids.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let frame = match self.adapter.receive_timeout(deadline - now) {
                Ok(frame) => frame,
                Err(CanError::Timeout) => break,
                Err(e) => return Err(e.into()),
            };
            if frame.id & 0xFFFF != gateway::GATEWAY_ID {
                continue;
            }
            match gateway::parse_reply(&frame) {
                Some((motor_id, raw)) => {
                    let id = motor_id as u8;
                    if ids.contains(&id) && readout.get(id).is_none() {
                        readout.positions.push((id, raw as i32));
                    }
                },
                None => readout.malformed += 1,
            }
        }
        Ok(readout)
    }

    fn write_positions(&mut self, targets: &[(u8, u16)]) -> Result<(), BusError> {
        for &(id, position) in targets {
            self.adapter
                .send(gateway::write_position_frame(id as u16, position))?;
        }
        Ok(())
    }

    fn ping(&mut self, id: u8, timeout: Duration) -> Result<bool, BusError> {
        Ok(self.read_positions(&[id], timeout)?.get(id).is_some())
    }

    fn set_torque(&mut self, _ids: &[u8], enabled: bool) -> Result<(), BusError> {
        debug!("CAN gateway does not forward torque commands (requested {})", enabled);
        Ok(())
    }
}

// ============================================================================
// STS 总线
// ============================================================================

/// STS 舵机总线
pub struct StsBus<T: StsLink> {
    link: T,
    ids: Vec<u8>,
    policy: FaultPolicy,
    malformed: MalformedWindow,
}

impl<T: StsLink> StsBus<T> {
    pub fn new(link: T, ids: Vec<u8>, policy: FaultPolicy) -> Self {
        Self {
            link,
            ids,
            malformed: MalformedWindow::new(BusKind::Sts, &policy),
            policy,
        }
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed.total()
    }

    fn target(&self, id: u8, value: f64) -> Result<u16, BusError> {
        if !value.is_finite() {
            return Err(BusError::NonFinite { id: id as u16 });
        }
        let rounded = value.round();
        let clamped = rounded.clamp(0.0, sts::POSITION_MAX as f64);
        if clamped != rounded {
            warn!(
                "STS servo {}: target {:.1} out of range, clamped to {}",
                id, value, clamped
            );
        }
        Ok(clamped as u16)
    }
}

impl<T: StsLink> ActuatorBus for StsBus<T> {
    fn kind(&self) -> BusKind {
        BusKind::Sts
    }

    fn joint_ids(&self) -> Vec<u16> {
        self.ids.iter().map(|&id| id as u16).collect()
    }

    fn probe(&mut self) -> Result<BTreeSet<u16>, BusError> {
        let mut present = BTreeSet::new();
        for &id in &self.ids {
            for _ in 0..self.policy.attempts() {
                if self.link.ping(id, self.policy.timeout)? {
                    present.insert(id as u16);
                    break;
                }
            }
        }
        debug!("STS probe: present {:?}", present);
        Ok(present)
    }

    fn read_positions(&mut self) -> Result<JointState, BusError> {
        let mut readout = self.link.read_positions(&self.ids, self.policy.timeout)?;
        let mut malformed = readout.malformed;

        // 同步读漏掉的舵机逐个重试
        for &id in &self.ids {
            let mut retries = 0;
            while readout.get(id).is_none() && retries < self.policy.max_retries {
                retries += 1;
                let single = self.link.read_positions(&[id], self.policy.timeout)?;
                malformed += single.malformed;
                readout.positions.extend(single.positions);
            }
        }
        self.malformed.record(malformed, Instant::now())?;

        let mut state = JointState::default();
        for &id in &self.ids {
            match readout.get(id) {
                Some(position) => state.positions.push(position as f64),
                None => {
                    return Err(BusError::Timeout {
                        bus: BusKind::Sts,
                        id: id as u16,
                        attempts: self.policy.attempts(),
                    });
                },
            }
        }
        Ok(state)
    }

    fn write_positions(&mut self, positions: &JointState) -> Result<(), BusError> {
        if positions.len() != self.ids.len() {
            return Err(BusError::LengthMismatch {
                expected: self.ids.len(),
                actual: positions.len(),
            });
        }
        let targets = self
            .ids
            .iter()
            .zip(positions.positions.iter())
            .map(|(&id, &value)| self.target(id, value).map(|raw| (id, raw)))
            .collect::<Result<SmallVec<[(u8, u16); 8]>, _>>()?;
        self.link.write_positions(&targets)
    }

    fn set_torque(&mut self, enabled: bool) -> Result<(), BusError> {
        self.link.set_torque(&self.ids, enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockStsChain, MockStsGateway};

    fn policy() -> FaultPolicy {
        FaultPolicy {
            timeout: Duration::from_millis(2),
            max_retries: 2,
            malformed_threshold: 2,
            malformed_window: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_sync_read_positions() {
        let chain = MockStsChain::new(&[1, 2, 3]);
        chain.set_position(1, 1000);
        chain.set_position(2, 2048);
        chain.set_position(3, -20);
        let mut bus = StsBus::new(TtlLink::new(chain), vec![1, 2, 3], policy());

        let state = bus.read_positions().unwrap();
        assert_eq!(state.positions.as_slice(), &[1000.0, 2048.0, -20.0]);
    }

    #[test]
    fn test_missing_reply_is_retried_individually() {
        let chain = MockStsChain::new(&[1, 2]);
        chain.set_position(2, 300);
        chain.drop_next_replies(2, 1);
        let mut bus = StsBus::new(TtlLink::new(chain.clone()), vec![1, 2], policy());

        let state = bus.read_positions().unwrap();
        assert_eq!(state.positions.as_slice(), &[2048.0, 300.0]);
    }

    #[test]
    fn test_timeout_after_exhausting_retries() {
        let chain = MockStsChain::new(&[1, 2]);
        chain.drop_next_replies(2, 10);
        let mut bus = StsBus::new(TtlLink::new(chain), vec![1, 2], policy());

        let err = bus.read_positions().unwrap_err();
        assert!(matches!(
            err,
            BusError::Timeout {
                bus: BusKind::Sts,
                id: 2,
                attempts: 3
            }
        ));
    }

    #[test]
    fn test_corrupted_replies_are_counted() {
        let chain = MockStsChain::new(&[1]);
        let mut bus = StsBus::new(TtlLink::new(chain.clone()), vec![1], policy());

        chain.corrupt_next_replies(1);
        // 首次应答损坏，重试成功
        assert!(bus.read_positions().is_ok());
        assert_eq!(bus.malformed_total(), 1);

        chain.corrupt_next_replies(2);
        let err = bus.read_positions().unwrap_err();
        assert!(matches!(err, BusError::Malformed { count: 3, .. }));
    }

    #[test]
    fn test_write_clamps_to_encoder_range() {
        let chain = MockStsChain::new(&[1, 2]);
        let mut bus = StsBus::new(TtlLink::new(chain.clone()), vec![1, 2], policy());
        bus.set_torque(true).unwrap();
        bus.write_positions(&JointState::from_positions([5000.0, -3.0]))
            .unwrap();
        assert_eq!(chain.goal(1), Some(4095));
        assert_eq!(chain.goal(2), Some(0));
        assert!(chain.torque_enabled(1));
    }

    #[test]
    fn test_probe_reports_present_servos() {
        let chain = MockStsChain::new(&[1, 3]);
        let mut bus = StsBus::new(TtlLink::new(chain), vec![1, 2, 3], policy());
        let present = bus.probe().unwrap();
        assert_eq!(present.into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_gateway_link_round_trip() {
        let gateway = MockStsGateway::new(&[1, 2]);
        gateway.set_position(1, 1111);
        let mut bus = StsBus::new(CanGatewayLink::new(gateway.clone()), vec![1, 2], policy());

        let state = bus.read_positions().unwrap();
        assert_eq!(state.positions.as_slice(), &[1111.0, 2048.0]);

        bus.write_positions(&JointState::from_positions([10.4, 20.6]))
            .unwrap();
        assert_eq!(gateway.position(1), 10);
        assert_eq!(gateway.position(2), 21);
    }
}
