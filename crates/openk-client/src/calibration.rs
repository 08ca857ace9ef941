//! 标定流程
//!
//! 1. 关闭扭矩，操作员把机械臂摆到中位，记录零点偏置
//! 2. 操作员依次把每个关节扫过全行程，记录原始最小/最大值
//! 3. 任一关节量程低于最小分辨率则失败，不写文件
//!
//! 与操作员的交互通过 [`CalibrationPrompt`] 完成：CLI 用终端提示实现，测试用脚本实现。

use crate::clock::Clock;
use crate::error::{BusRole, ControlError};
use openk_bus::ActuatorBus;
use openk_protocol::{JointLayout, JointState};
use openk_tools::{CalibrationError, CalibrationRecord, CalibrationSet, CalibrationStore, NormMode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 操作员交互
pub trait CalibrationPrompt {
    /// 等待操作员把机械臂摆到中位；返回错误表示中止
    fn wait_for_middle_pose(&mut self, arm_id: &str) -> Result<(), CalibrationError>;

    /// 开始扫描
    fn begin_sweep(&mut self, joints: &[String]) {
        let _ = joints;
    }

    /// 每次采样后调用，返回 `true` 结束扫描
    fn sweep_finished(&mut self, samples: u32, mins: &[f64], maxs: &[f64]) -> bool;
}

/// 标定参数
#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// 被标定的机械臂角色（用于错误信息）
    pub role: BusRole,
    /// 每个关节的最小量程（该关节所在总线的原始单位，按布局顺序）
    pub min_spans: Vec<f64>,
    /// 扫描采样上限
    pub max_samples: u32,
    /// 采样间隔
    pub sample_interval: Duration,
    /// 每个关节的归一化模式（按布局顺序）
    pub norm_modes: Vec<NormMode>,
    /// 每个关节的方向（按布局顺序）
    pub signs: Vec<i8>,
}

impl CalibrationSettings {
    /// 所有关节使用同一模式、正方向
    pub fn uniform(joints: usize, mode: NormMode) -> Self {
        Self {
            role: BusRole::Leader,
            min_spans: vec![50.0; joints],
            max_samples: 20_000,
            sample_interval: Duration::from_millis(10),
            norm_modes: vec![mode; joints],
            signs: vec![1; joints],
        }
    }
}

/// 对一条总线执行标定流程
pub fn run_calibration<B, P, C>(
    bus: &mut B,
    layout: &JointLayout,
    arm_id: &str,
    settings: &CalibrationSettings,
    prompt: &mut P,
    clock: &C,
) -> Result<CalibrationSet, ControlError>
where
    B: ActuatorBus + ?Sized,
    P: CalibrationPrompt + ?Sized,
    C: Clock + ?Sized,
{
    let n = layout.len();
    let role = settings.role;
    if bus.len() != n
        || settings.norm_modes.len() != n
        || settings.signs.len() != n
        || settings.min_spans.len() != n
    {
        return Err(ControlError::LayoutMismatch {
            role,
            expected: n,
            actual: bus.len(),
        });
    }

    info!("Calibrating '{}' ({} joints on {} bus)", arm_id, n, bus.kind());
    bus.set_torque(false).map_err(ControlError::bus(role))?;

    // 中位
    prompt.wait_for_middle_pose(arm_id)?;
    let middle = read_finite(bus, layout, role)?;
    debug!("Middle pose: {:?}", middle.positions);

    // 扫描
    prompt.begin_sweep(layout.names());
    let mut mins: Vec<f64> = middle.positions.to_vec();
    let mut maxs: Vec<f64> = middle.positions.to_vec();
    let mut samples = 0u32;
    loop {
        let state = read_finite(bus, layout, role)?;
        for (i, &v) in state.positions.iter().enumerate() {
            mins[i] = mins[i].min(v);
            maxs[i] = maxs[i].max(v);
        }
        samples += 1;
        if prompt.sweep_finished(samples, &mins, &maxs) {
            break;
        }
        if samples >= settings.max_samples {
            warn!("Calibration sweep stopped at the sample cap ({})", settings.max_samples);
            break;
        }
        clock.sleep(settings.sample_interval);
    }
    info!("Recorded {} sweep samples", samples);

    let ids = bus.joint_ids();
    let mut records = Vec::with_capacity(n);
    for (i, name) in layout.names().iter().enumerate() {
        let span = maxs[i] - mins[i];
        let min_span = settings.min_spans[i];
        if span < min_span {
            return Err(CalibrationError::DegenerateSpan {
                joint: name.clone(),
                span,
                min_span,
            }
            .into());
        }
        let offset = middle.positions[i];
        records.push(CalibrationRecord {
            joint: name.clone(),
            id: ids[i],
            offset,
            sign: settings.signs[i],
            range_min: mins[i] - offset,
            range_max: maxs[i] - offset,
            norm_mode: settings.norm_modes[i],
        });
    }

    Ok(CalibrationSet::new(arm_id, records)?)
}

/// 标定并保存；失败时不写任何文件
pub fn calibrate_and_save<B, P, C>(
    bus: &mut B,
    layout: &JointLayout,
    arm_id: &str,
    settings: &CalibrationSettings,
    prompt: &mut P,
    clock: &C,
    store: &CalibrationStore,
) -> Result<(CalibrationSet, PathBuf), ControlError>
where
    B: ActuatorBus + ?Sized,
    P: CalibrationPrompt + ?Sized,
    C: Clock + ?Sized,
{
    let set = run_calibration(bus, layout, arm_id, settings, prompt, clock)?;
    let path = store.save(&set)?;
    Ok((set, path))
}

fn read_finite<B: ActuatorBus + ?Sized>(
    bus: &mut B,
    layout: &JointLayout,
    role: BusRole,
) -> Result<JointState, ControlError> {
    let state = bus.read_positions().map_err(ControlError::bus(role))?;
    if state.len() != layout.len() {
        return Err(ControlError::LayoutMismatch {
            role,
            expected: layout.len(),
            actual: state.len(),
        });
    }
    if let Some(i) = state.positions.iter().position(|v| !v.is_finite()) {
        return Err(CalibrationError::NoReading {
            joint: layout.name(i).unwrap_or("?").to_string(),
        }
        .into());
    }
    Ok(state)
}

/// 按固定脚本应答的提示器（测试与无人值守使用）
#[derive(Debug, Clone)]
pub struct ScriptedPrompt {
    /// 扫描多少个样本后结束
    pub sweep_samples: u32,
    /// 中位提示时中止
    pub abort: bool,
}

impl CalibrationPrompt for ScriptedPrompt {
    fn wait_for_middle_pose(&mut self, _arm_id: &str) -> Result<(), CalibrationError> {
        if self.abort {
            return Err(CalibrationError::Aborted("operator cancelled".to_string()));
        }
        Ok(())
    }

    fn sweep_finished(&mut self, samples: u32, _mins: &[f64], _maxs: &[f64]) -> bool {
        samples >= self.sweep_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use openk_bus::mock::MockBus;

    fn layout() -> JointLayout {
        JointLayout::new(["pan", "grip"]).unwrap()
    }

    #[test]
    fn test_records_offset_and_range() {
        let (mut bus, handle) = MockBus::new(&[1, 2]);
        bus.set_torque(true).unwrap();
        handle.push_script([
            JointState::from_positions([2048.0, 1000.0]),
            JointState::from_positions([1000.0, 1000.0]),
            JointState::from_positions([3000.0, 3000.0]),
            JointState::from_positions([2048.0, 2000.0]),
        ]);
        let mut settings = CalibrationSettings::uniform(2, NormMode::RangeM100_100);
        settings.norm_modes[1] = NormMode::Range0_100;
        settings.signs[0] = -1;
        let mut prompt = ScriptedPrompt {
            sweep_samples: 3,
            abort: false,
        };

        let set = run_calibration(&mut bus, &layout(), "leader", &settings, &mut prompt, &ManualClock::new()).unwrap();
        assert!(!handle.torque_enabled());

        let pan = &set.records[0];
        assert_eq!(pan.offset, 2048.0);
        assert_eq!(pan.range_min, -1048.0);
        assert_eq!(pan.range_max, 952.0);
        assert_eq!(pan.sign, -1);

        let grip = &set.records[1];
        assert_eq!(grip.offset, 1000.0);
        assert_eq!(grip.range_min, 0.0);
        assert_eq!(grip.range_max, 2000.0);
        assert_eq!(grip.norm_mode, NormMode::Range0_100);
    }

    #[test]
    fn test_sample_cap_bounds_sweep() {
        let (mut bus, handle) = MockBus::new(&[1, 2]);
        handle.set_positions(&[0.0, 0.0]);
        let mut settings = CalibrationSettings::uniform(2, NormMode::RangeM100_100);
        settings.max_samples = 5;
        settings.min_spans = vec![0.0; 2];
        let mut prompt = ScriptedPrompt {
            sweep_samples: u32::MAX,
            abort: false,
        };
        let clock = ManualClock::new();
        let err = run_calibration(&mut bus, &layout(), "leader", &settings, &mut prompt, &clock).unwrap_err();
        // 零量程即使阈值为 0 也无法构成合法记录
        assert!(matches!(err, ControlError::Calibration(CalibrationError::InvalidRecord { .. })));
        assert_eq!(handle.read_calls(), 6);
        assert_eq!(clock.now(), Duration::from_millis(40));
    }

    #[test]
    fn test_abort_propagates() {
        let (mut bus, _handle) = MockBus::new(&[1, 2]);
        let settings = CalibrationSettings::uniform(2, NormMode::RangeM100_100);
        let mut prompt = ScriptedPrompt {
            sweep_samples: 1,
            abort: true,
        };
        let err = run_calibration(&mut bus, &layout(), "leader", &settings, &mut prompt, &ManualClock::new()).unwrap_err();
        assert!(matches!(err, ControlError::Calibration(CalibrationError::Aborted(_))));
    }

    #[test]
    fn test_layout_mismatch() {
        let (mut bus, _handle) = MockBus::new(&[1, 2, 3]);
        let settings = CalibrationSettings::uniform(2, NormMode::RangeM100_100);
        let mut prompt = ScriptedPrompt {
            sweep_samples: 1,
            abort: false,
        };
        assert!(matches!(
            run_calibration(&mut bus, &layout(), "leader", &settings, &mut prompt, &ManualClock::new()),
            Err(ControlError::LayoutMismatch { .. })
        ));
    }
}
