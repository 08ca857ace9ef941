//! 模拟硬件（无真实设备依赖）
//!
//! - [`MockBus`]：可编程的 `ActuatorBus`，用于控制循环、录制和回放的上层测试
//! - [`MockDamiaoAdapter`]：模拟达妙电机组的 `CanAdapter`
//! - [`MockStsChain`]：模拟 STS 菊花链的 `SerialLink`
//! - [`MockStsGateway`]：模拟 STS CAN 网关的 `CanAdapter`
//! - [`BridgeLoopback`]：把 USB-CAN 串口桥的字节流转接到任意模拟 `CanAdapter`

use crate::serial::SerialLink;
use crate::{ActuatorBus, BusError, BusKind, CanAdapter, CanError, CanFrame, DamiaoMotor, JointState};
use openk_protocol::bridge;
use openk_protocol::damiao::{
    DamiaoFeedback, MitCommand, MotorState, POS_VEL_ID_OFFSET, PosVelCommand, SpecialCommand,
    parse_refresh,
};
use openk_protocol::sts::{self, Instruction, PacketParser, StatusPacket, gateway};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// MockBus
// ============================================================================

type Hook = Box<dyn FnMut() + Send>;

struct MockState {
    ids: Vec<u16>,
    present: BTreeSet<u16>,
    positions: JointState,
    script: VecDeque<JointState>,
    fail_next_reads: u32,
    fail_next_writes: u32,
    reads_always_fail: bool,
    writes_always_fail: bool,
    echo_writes: bool,
    writes: Vec<JointState>,
    torque: bool,
    read_calls: u64,
    write_calls: u64,
    read_hook: Option<Hook>,
}

/// 可编程的模拟总线
pub struct MockBus {
    ids: Vec<u16>,
    shared: Arc<Mutex<MockState>>,
}

/// 模拟总线的控制句柄（测试侧持有）
#[derive(Clone)]
pub struct MockBusHandle {
    shared: Arc<Mutex<MockState>>,
}

impl MockBus {
    /// 创建模拟总线，所有执行器在线、位置为 0
    pub fn new(ids: &[u16]) -> (Self, MockBusHandle) {
        let shared = Arc::new(Mutex::new(MockState {
            ids: ids.to_vec(),
            present: ids.iter().copied().collect(),
            positions: JointState::uniform(ids.len(), 0.0),
            script: VecDeque::new(),
            fail_next_reads: 0,
            fail_next_writes: 0,
            reads_always_fail: false,
            writes_always_fail: false,
            echo_writes: true,
            writes: Vec::new(),
            torque: false,
            read_calls: 0,
            write_calls: 0,
            read_hook: None,
        }));
        (
            Self {
                ids: ids.to_vec(),
                shared: shared.clone(),
            },
            MockBusHandle { shared },
        )
    }
}

fn mock_timeout(state: &MockState) -> BusError {
    BusError::Timeout {
        bus: BusKind::Mock,
        id: state.ids.first().copied().unwrap_or_default(),
        attempts: 1,
    }
}

impl ActuatorBus for MockBus {
    fn kind(&self) -> BusKind {
        BusKind::Mock
    }

    fn joint_ids(&self) -> Vec<u16> {
        self.ids.clone()
    }

    fn probe(&mut self) -> Result<BTreeSet<u16>, BusError> {
        Ok(self.shared.lock().present.clone())
    }

    fn read_positions(&mut self) -> Result<JointState, BusError> {
        // 钩子在锁外执行，允许它推进模拟时钟或操作句柄
        let hook = self.shared.lock().read_hook.take();
        if let Some(mut hook) = hook {
            hook();
            let mut state = self.shared.lock();
            if state.read_hook.is_none() {
                state.read_hook = Some(hook);
            }
        }

        let mut state = self.shared.lock();
        state.read_calls += 1;
        if state.reads_always_fail {
            return Err(mock_timeout(&state));
        }
        if state.fail_next_reads > 0 {
            state.fail_next_reads -= 1;
            return Err(mock_timeout(&state));
        }
        if let Some(next) = state.script.pop_front() {
            state.positions = next;
        }
        Ok(state.positions.clone())
    }

    fn write_positions(&mut self, positions: &JointState) -> Result<(), BusError> {
        let mut state = self.shared.lock();
        state.write_calls += 1;
        if positions.len() != state.ids.len() {
            return Err(BusError::LengthMismatch {
                expected: state.ids.len(),
                actual: positions.len(),
            });
        }
        if state.writes_always_fail {
            return Err(mock_timeout(&state));
        }
        if state.fail_next_writes > 0 {
            state.fail_next_writes -= 1;
            return Err(mock_timeout(&state));
        }
        if state.echo_writes {
            state.positions = positions.clone();
        }
        state.writes.push(positions.clone());
        Ok(())
    }

    fn set_torque(&mut self, enabled: bool) -> Result<(), BusError> {
        self.shared.lock().torque = enabled;
        Ok(())
    }
}

impl MockBusHandle {
    pub fn set_positions(&self, positions: &[f64]) {
        self.shared.lock().positions = JointState::from_positions(positions.iter().copied());
    }

    /// 依次作为后续读取的结果，读完后保持最后一个
    pub fn push_script(&self, states: impl IntoIterator<Item = JointState>) {
        self.shared.lock().script.extend(states);
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.shared.lock().fail_next_reads = n;
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.shared.lock().fail_next_writes = n;
    }

    pub fn set_reads_failing(&self, failing: bool) {
        self.shared.lock().reads_always_fail = failing;
    }

    pub fn set_writes_failing(&self, failing: bool) {
        self.shared.lock().writes_always_fail = failing;
    }

    /// 写入是否回显为当前位置（默认开启）
    pub fn set_echo_writes(&self, echo: bool) {
        self.shared.lock().echo_writes = echo;
    }

    /// 每次读取前调用（用于推进模拟时钟等）
    pub fn set_read_hook(&self, hook: impl FnMut() + Send + 'static) {
        self.shared.lock().read_hook = Some(Box::new(hook));
    }

    /// 让执行器从探测结果中消失
    pub fn remove_actuator(&self, id: u16) {
        self.shared.lock().present.remove(&id);
    }

    pub fn writes(&self) -> Vec<JointState> {
        self.shared.lock().writes.clone()
    }

    pub fn last_write(&self) -> Option<JointState> {
        self.shared.lock().writes.last().cloned()
    }

    /// 成功写入次数
    pub fn write_count(&self) -> usize {
        self.shared.lock().writes.len()
    }

    /// 写入调用次数（含失败）
    pub fn write_calls(&self) -> u64 {
        self.shared.lock().write_calls
    }

    pub fn read_calls(&self) -> u64 {
        self.shared.lock().read_calls
    }

    pub fn torque_enabled(&self) -> bool {
        self.shared.lock().torque
    }
}

// ============================================================================
// 达妙电机组
// ============================================================================

struct MotorSim {
    motor: DamiaoMotor,
    position: f64,
    enabled: bool,
    silent: bool,
}

struct DamiaoSim {
    motors: Vec<MotorSim>,
    rx: VecDeque<CanFrame>,
    garbage: u32,
    sent: u64,
}

impl DamiaoSim {
    fn reply(&mut self, index: usize) {
        let sim = &self.motors[index];
        if sim.silent {
            return;
        }
        let limits = sim.motor.model.limits();
        for _ in 0..self.garbage {
            let nibble = (sim.motor.slave_id & 0x0F) as u8;
            self.rx
                .push_back(CanFrame::new_standard(sim.motor.master_id, &[nibble, 0, 0]));
        }
        self.garbage = 0;
        let feedback = DamiaoFeedback {
            motor_id: (sim.motor.slave_id & 0x0F) as u8,
            state: if sim.enabled {
                MotorState::Enabled
            } else {
                MotorState::Disabled
            },
            position: sim.position as f32,
            velocity: 0.0,
            torque: 0.0,
            t_mos: 30,
            t_rotor: 30,
        };
        self.rx.push_back(feedback.encode(sim.motor.master_id, limits));
    }
}

/// 模拟达妙电机组
#[derive(Clone)]
pub struct MockDamiaoAdapter {
    sim: Arc<Mutex<DamiaoSim>>,
}

impl MockDamiaoAdapter {
    pub fn new(motors: &[DamiaoMotor]) -> Self {
        let motors = motors
            .iter()
            .map(|&motor| MotorSim {
                motor,
                position: 0.0,
                enabled: false,
                silent: false,
            })
            .collect();
        Self {
            sim: Arc::new(Mutex::new(DamiaoSim {
                motors,
                rx: VecDeque::new(),
                garbage: 0,
                sent: 0,
            })),
        }
    }

    pub fn set_position(&self, slave_id: u16, position: f64) {
        let mut sim = self.sim.lock();
        if let Some(m) = sim.motors.iter_mut().find(|m| m.motor.slave_id == slave_id) {
            m.position = position;
        }
    }

    pub fn position(&self, slave_id: u16) -> f64 {
        let sim = self.sim.lock();
        sim.motors
            .iter()
            .find(|m| m.motor.slave_id == slave_id)
            .map_or(f64::NAN, |m| m.position)
    }

    /// 电机不再应答
    pub fn silence(&self, slave_id: u16) {
        let mut sim = self.sim.lock();
        if let Some(m) = sim.motors.iter_mut().find(|m| m.motor.slave_id == slave_id) {
            m.silent = true;
        }
    }

    /// 下一次应答前插入 `n` 个坏包
    pub fn inject_garbage(&self, n: u32) {
        self.sim.lock().garbage = n;
    }

    /// 主机已发送的帧数
    pub fn sent_count(&self) -> u64 {
        self.sim.lock().sent
    }
}

impl CanAdapter for MockDamiaoAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        let mut sim = self.sim.lock();
        sim.sent += 1;

        if let Some(slave_id) = parse_refresh(&frame) {
            if let Some(index) = sim.motors.iter().position(|m| m.motor.slave_id == slave_id) {
                sim.reply(index);
            }
            return Ok(());
        }

        let by_slave = sim
            .motors
            .iter()
            .position(|m| m.motor.slave_id as u32 == frame.id);
        if let Some(index) = by_slave {
            if let Some(command) = SpecialCommand::from_frame(&frame) {
                match command {
                    SpecialCommand::Enable => sim.motors[index].enabled = true,
                    SpecialCommand::Disable => sim.motors[index].enabled = false,
                    SpecialCommand::SaveZero => sim.motors[index].position = 0.0,
                    SpecialCommand::ClearError => {},
                }
            } else {
                let limits = sim.motors[index].motor.model.limits();
                let command = MitCommand::from_frame(&frame, limits)
                    .map_err(|e| CanError::Device(e.to_string()))?;
                if sim.motors[index].enabled {
                    sim.motors[index].position = command.position as f64;
                }
            }
            sim.reply(index);
            return Ok(());
        }

        let by_pos_vel = sim
            .motors
            .iter()
            .position(|m| (POS_VEL_ID_OFFSET + m.motor.slave_id) as u32 == frame.id);
        if let Some(index) = by_pos_vel {
            let command =
                PosVelCommand::from_frame(&frame).map_err(|e| CanError::Device(e.to_string()))?;
            if sim.motors[index].enabled {
                sim.motors[index].position = command.position as f64;
            }
            sim.reply(index);
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<CanFrame, CanError> {
        self.sim.lock().rx.pop_front().ok_or(CanError::Timeout)
    }
}

// ============================================================================
// STS 菊花链
// ============================================================================

struct ServoSim {
    id: u8,
    position: i32,
    goal: Option<u16>,
    torque: bool,
    drop_replies: u32,
}

struct StsSim {
    servos: Vec<ServoSim>,
    corrupt_replies: u32,
    rx: VecDeque<u8>,
}

impl StsSim {
    fn servo(&mut self, id: u8) -> Option<&mut ServoSim> {
        self.servos.iter_mut().find(|s| s.id == id)
    }

    fn reply(&mut self, id: u8, params: &[u8]) {
        let Some(servo) = self.servo(id) else {
            return;
        };
        if servo.drop_replies > 0 {
            servo.drop_replies -= 1;
            return;
        }
        let mut bytes = StatusPacket {
            id,
            error: 0,
            params: SmallVec::from_slice(params),
        }
        .encode();
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            let last = bytes.len() - 1;
            bytes[last] ^= 0xA5;
        }
        self.rx.extend(bytes);
    }

    fn reply_position(&mut self, id: u8) {
        if let Some(servo) = self.servo(id) {
            let raw = sts::encode_position(servo.position).to_le_bytes();
            self.reply(id, &raw);
        }
    }

    fn write_register(&mut self, id: u8, address: u8, data: &[u8]) {
        let Some(servo) = self.servo(id) else {
            return;
        };
        match (address, data) {
            (sts::REG_GOAL_POSITION, [lo, hi, ..]) => {
                let goal = u16::from_le_bytes([*lo, *hi]);
                servo.goal = Some(goal);
                if servo.torque {
                    servo.position = goal as i32;
                }
            },
            (sts::REG_TORQUE_ENABLE, [value, ..]) => servo.torque = *value != 0,
            _ => {},
        }
    }

    fn handle(&mut self, packet: StatusPacket) {
        // 指令包与应答包格式相同，`error` 位置即指令码
        let Ok(instruction) = Instruction::try_from(packet.error) else {
            return;
        };
        let params = packet.params.as_slice();
        match instruction {
            Instruction::Ping => self.reply(packet.id, &[]),
            Instruction::Read => {
                if params.first() == Some(&sts::REG_PRESENT_POSITION) {
                    self.reply_position(packet.id);
                }
            },
            Instruction::SyncRead => {
                if let [sts::REG_PRESENT_POSITION, _len, ids @ ..] = params {
                    for &id in ids {
                        self.reply_position(id);
                    }
                }
            },
            Instruction::Write => {
                if let [address, data @ ..] = params {
                    self.write_register(packet.id, *address, data);
                }
            },
            Instruction::SyncWrite => {
                if let [address, len, rest @ ..] = params {
                    let stride = *len as usize + 1;
                    for entry in rest.chunks_exact(stride) {
                        self.write_register(entry[0], *address, &entry[1..]);
                    }
                }
            },
        }
    }
}

/// 模拟 STS 菊花链（所有舵机初始位置 2048）
#[derive(Clone)]
pub struct MockStsChain {
    sim: Arc<Mutex<StsSim>>,
}

impl MockStsChain {
    pub fn new(ids: &[u8]) -> Self {
        let servos = ids
            .iter()
            .map(|&id| ServoSim {
                id,
                position: 2048,
                goal: None,
                torque: false,
                drop_replies: 0,
            })
            .collect();
        Self {
            sim: Arc::new(Mutex::new(StsSim {
                servos,
                corrupt_replies: 0,
                rx: VecDeque::new(),
            })),
        }
    }

    pub fn set_position(&self, id: u8, position: i32) {
        if let Some(servo) = self.sim.lock().servo(id) {
            servo.position = position;
        }
    }

    pub fn position(&self, id: u8) -> Option<i32> {
        self.sim.lock().servo(id).map(|s| s.position)
    }

    pub fn goal(&self, id: u8) -> Option<u16> {
        self.sim.lock().servo(id).and_then(|s| s.goal)
    }

    pub fn torque_enabled(&self, id: u8) -> bool {
        self.sim.lock().servo(id).is_some_and(|s| s.torque)
    }

    /// 舵机 `id` 的后 `n` 个应答丢失
    pub fn drop_next_replies(&self, id: u8, n: u32) {
        if let Some(servo) = self.sim.lock().servo(id) {
            servo.drop_replies = n;
        }
    }

    /// 后 `n` 个应答校验和损坏
    pub fn corrupt_next_replies(&self, n: u32) {
        self.sim.lock().corrupt_replies = n;
    }
}

impl SerialLink for MockStsChain {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut parser = PacketParser::new();
        parser.push(bytes);
        let mut sim = self.sim.lock();
        while let Some(result) = parser.next_packet() {
            match result {
                Ok(packet) => sim.handle(packet),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut sim = self.sim.lock();
        let n = buf.len().min(sim.rx.len());
        for (slot, byte) in buf.iter_mut().zip(sim.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.sim.lock().rx.clear();
        Ok(())
    }
}

// ============================================================================
// STS CAN 网关
// ============================================================================

struct GatewaySim {
    positions: BTreeMap<u16, u16>,
    rx: VecDeque<CanFrame>,
}

/// 模拟 STS CAN 网关（所有舵机初始位置 2048）
#[derive(Clone)]
pub struct MockStsGateway {
    sim: Arc<Mutex<GatewaySim>>,
}

impl MockStsGateway {
    pub fn new(ids: &[u16]) -> Self {
        Self {
            sim: Arc::new(Mutex::new(GatewaySim {
                positions: ids.iter().map(|&id| (id, 2048)).collect(),
                rx: VecDeque::new(),
            })),
        }
    }

    pub fn set_position(&self, id: u16, position: u16) {
        self.sim.lock().positions.insert(id, position);
    }

    pub fn position(&self, id: u16) -> u16 {
        self.sim.lock().positions.get(&id).copied().unwrap_or_default()
    }
}

impl CanAdapter for MockStsGateway {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        let mut sim = self.sim.lock();
        match gateway::parse_request(&frame) {
            Some(gateway::GatewayRequest::Read { motor_id }) => {
                if let Some(&position) = sim.positions.get(&motor_id) {
                    sim.rx.push_back(gateway::reply_frame(motor_id, position));
                }
            },
            Some(gateway::GatewayRequest::Write { motor_id, position }) => {
                if let Some(slot) = sim.positions.get_mut(&motor_id) {
                    *slot = position;
                }
            },
            None => {},
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<CanFrame, CanError> {
        self.sim.lock().rx.pop_front().ok_or(CanError::Timeout)
    }
}

// ============================================================================
// USB-CAN 串口桥回环
// ============================================================================

/// 把串口桥字节流转接到模拟 `CanAdapter`
pub struct BridgeLoopback<A: CanAdapter> {
    inner: Arc<Mutex<A>>,
    written: Arc<Mutex<Vec<u8>>>,
    pending: Arc<Mutex<VecDeque<u8>>>,
}

impl<A: CanAdapter> Clone for BridgeLoopback<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            written: self.written.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<A: CanAdapter> BridgeLoopback<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            written: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// 主机写出的全部字节
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }
}

impl<A: CanAdapter> SerialLink for BridgeLoopback<A> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.written.lock().extend_from_slice(bytes);
        let mut inner = self.inner.lock();
        for chunk in bytes.chunks(bridge::TX_FRAME_LEN) {
            let frame = bridge::decode_tx(chunk)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad bridge frame"))?;
            inner.send(frame).map_err(io::Error::other)?;
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut pending = self.pending.lock();
        {
            let mut inner = self.inner.lock();
            while let Some(frame) = inner.try_receive().map_err(io::Error::other)? {
                pending.extend(bridge::encode_rx(&frame));
            }
        }
        let n = buf.len().min(pending.len());
        for (slot, byte) in buf.iter_mut().zip(pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
