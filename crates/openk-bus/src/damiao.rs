//! 达妙电机总线
//!
//! 读：向每个电机发送刷新请求，在反馈 ID 上收集应答；未应答的电机按策略重试。
//! 写：每个电机一帧 MIT 或位置速度指令，之后非阻塞地排空电机回传的反馈帧。

use crate::{
    ActuatorBus, BusError, BusKind, CanAdapter, CanError, CanFrame, FaultPolicy, JointState,
    MalformedWindow,
};
use openk_protocol::damiao::{
    DamiaoFeedback, DamiaoModel, MitCommand, PosVelCommand, SpecialCommand, refresh_frame,
};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// 单个电机的配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamiaoMotor {
    pub model: DamiaoModel,
    /// 命令 ID
    pub slave_id: u16,
    /// 反馈 ID
    pub master_id: u16,
}

impl DamiaoMotor {
    pub const fn new(model: DamiaoModel, slave_id: u16, master_id: u16) -> Self {
        Self {
            model,
            slave_id,
            master_id,
        }
    }
}

/// 写位置时使用的控制模式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DamiaoControlMode {
    /// MIT 阻抗控制（速度与前馈力矩为 0）
    Mit { kp: f32, kd: f32 },
    /// 位置速度模式，`velocity` 为速度上限（rad/s）
    PosVel { velocity: f32 },
}

impl Default for DamiaoControlMode {
    fn default() -> Self {
        DamiaoControlMode::Mit { kp: 20.0, kd: 1.0 }
    }
}

/// 达妙电机总线
pub struct DamiaoBus<C: CanAdapter> {
    adapter: C,
    motors: Vec<DamiaoMotor>,
    mode: DamiaoControlMode,
    policy: FaultPolicy,
    malformed: MalformedWindow,
    latest: Vec<Option<DamiaoFeedback>>,
}

impl<C: CanAdapter> DamiaoBus<C> {
    pub fn new(
        adapter: C,
        motors: Vec<DamiaoMotor>,
        mode: DamiaoControlMode,
        policy: FaultPolicy,
    ) -> Self {
        let latest = vec![None; motors.len()];
        Self {
            adapter,
            motors,
            mode,
            malformed: MalformedWindow::new(BusKind::Damiao, &policy),
            policy,
            latest,
        }
    }

    pub fn motors(&self) -> &[DamiaoMotor] {
        &self.motors
    }

    /// 最近一次收到的反馈（含速度、力矩、温度）
    pub fn latest_feedback(&self, index: usize) -> Option<&DamiaoFeedback> {
        self.latest.get(index).and_then(Option::as_ref)
    }

    /// 会话内坏包总数
    pub fn malformed_total(&self) -> u64 {
        self.malformed.total()
    }

    pub fn adapter_mut(&mut self) -> &mut C {
        &mut self.adapter
    }

    /// 处理一帧：属于某个电机则更新缓存并返回其下标
    fn absorb(&mut self, frame: CanFrame, malformed: &mut u32) -> Option<usize> {
        if !self.motors.iter().any(|m| m.master_id as u32 == frame.id) {
            trace!("Ignoring CAN frame 0x{:X}", frame.id);
            return None;
        }
        let nibble = frame.data[0] & 0x0F;
        let Some(index) = self
            .motors
            .iter()
            .position(|m| m.master_id as u32 == frame.id && (m.slave_id & 0x0F) as u8 == nibble)
        else {
            *malformed += 1;
            return None;
        };

        let motor = self.motors[index];
        match DamiaoFeedback::decode(&frame, motor.model.limits()) {
            Ok(feedback) => {
                if feedback.state.is_fault() {
                    warn!(
                        "Damiao motor 0x{:02X} reports {:?} (T_mos={}℃, T_rotor={}℃)",
                        motor.slave_id, feedback.state, feedback.t_mos, feedback.t_rotor
                    );
                }
                self.latest[index] = Some(feedback);
                Some(index)
            },
            Err(e) => {
                trace!("Malformed feedback from 0x{:X}: {}", frame.id, e);
                *malformed += 1;
                None
            },
        }
    }

    /// 在截止时间前收集反馈，直到 `pending` 全部清空
    fn collect(
        &mut self,
        pending: &mut [bool],
        deadline: Instant,
        malformed: &mut u32,
    ) -> Result<(), BusError> {
        while pending.iter().any(|p| *p) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.adapter.receive_timeout(deadline - now) {
                Ok(frame) => {
                    if let Some(index) = self.absorb(frame, malformed) {
                        pending[index] = false;
                    }
                },
                Err(CanError::Timeout) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// 刷新所有电机状态，返回最终仍未应答的下标
    fn refresh(&mut self) -> Result<Vec<usize>, BusError> {
        let mut pending = vec![true; self.motors.len()];
        let mut malformed = 0;

        for attempt in 0..self.policy.attempts() {
            for (index, motor) in self.motors.iter().enumerate() {
                if pending[index] {
                    self.adapter.send(refresh_frame(motor.slave_id))?;
                }
            }
            let deadline = Instant::now() + self.policy.timeout;
            if let Err(e) = self.collect(&mut pending, deadline, &mut malformed) {
                self.malformed.record(malformed, Instant::now())?;
                return Err(e);
            }
            if !pending.iter().any(|p| *p) {
                break;
            }
            debug!(
                "Damiao refresh attempt {} missed {} motors",
                attempt + 1,
                pending.iter().filter(|p| **p).count()
            );
        }

        self.malformed.record(malformed, Instant::now())?;
        Ok(pending
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.then_some(i))
            .collect())
    }

    /// 排空接收缓冲（写指令后电机会回传反馈）
    fn drain(&mut self) -> Result<(), BusError> {
        let mut malformed = 0;
        let limit = self.motors.len() * 4;
        for _ in 0..limit {
            match self.adapter.try_receive()? {
                Some(frame) => {
                    self.absorb(frame, &mut malformed);
                },
                None => break,
            }
        }
        self.malformed.record(malformed, Instant::now())
    }

    fn command_frame(&self, motor: &DamiaoMotor, target: f64) -> Result<CanFrame, BusError> {
        if !target.is_finite() {
            return Err(BusError::NonFinite { id: motor.slave_id });
        }
        let limits = motor.model.limits();
        let p_max = limits.p_max as f64;
        let position = target.clamp(-p_max, p_max);
        if position != target {
            warn!(
                "Damiao motor 0x{:02X}: target {:.4} rad out of range, clamped to {:.4}",
                motor.slave_id, target, position
            );
        }

        Ok(match self.mode {
            DamiaoControlMode::Mit { kp, kd } => {
                MitCommand::position(position as f32, kp, kd).to_frame(motor.slave_id, limits)
            },
            DamiaoControlMode::PosVel { velocity } => PosVelCommand {
                position: position as f32,
                velocity,
            }
            .to_frame(motor.slave_id),
        })
    }
}

impl<C: CanAdapter> ActuatorBus for DamiaoBus<C> {
    fn kind(&self) -> BusKind {
        BusKind::Damiao
    }

    fn joint_ids(&self) -> Vec<u16> {
        self.motors.iter().map(|m| m.slave_id).collect()
    }

    fn probe(&mut self) -> Result<BTreeSet<u16>, BusError> {
        let missing = self.refresh()?;
        let present = self
            .motors
            .iter()
            .enumerate()
            .filter(|(i, _)| !missing.contains(i))
            .map(|(_, m)| m.slave_id)
            .collect();
        debug!("Damiao probe: present {:?}", present);
        Ok(present)
    }

    fn read_positions(&mut self) -> Result<JointState, BusError> {
        let missing = self.refresh()?;
        if let Some(&index) = missing.first() {
            return Err(BusError::Timeout {
                bus: BusKind::Damiao,
                id: self.motors[index].slave_id,
                attempts: self.policy.attempts(),
            });
        }

        let mut state = JointState::default();
        for feedback in self.latest.iter().flatten() {
            state.positions.push(feedback.position as f64);
        }
        Ok(state)
    }

    fn write_positions(&mut self, positions: &JointState) -> Result<(), BusError> {
        if positions.len() != self.motors.len() {
            return Err(BusError::LengthMismatch {
                expected: self.motors.len(),
                actual: positions.len(),
            });
        }

        // 先全部编码，避免非法值导致部分电机已动作
        let frames = self
            .motors
            .iter()
            .zip(positions.positions.iter())
            .map(|(motor, &target)| self.command_frame(motor, target))
            .collect::<Result<Vec<_>, _>>()?;

        for frame in frames {
            self.adapter.send(frame)?;
        }
        self.drain()
    }

    fn set_torque(&mut self, enabled: bool) -> Result<(), BusError> {
        let command = if enabled {
            SpecialCommand::Enable
        } else {
            SpecialCommand::Disable
        };
        for motor in &self.motors {
            self.adapter.send(command.to_frame(motor.slave_id))?;
        }
        debug!(
            "Damiao torque {} for {} motors",
            if enabled { "enabled" } else { "disabled" },
            self.motors.len()
        );
        self.drain()
    }
}
