//! # 遥操作配置
//!
//! TOML 配置文件，默认路径：
//! - Linux: `~/.config/openk/teleop.toml`
//! - macOS: `~/Library/Application Support/openk/teleop.toml`
//! - Windows: `%APPDATA%\openk\teleop.toml`
//!
//! 所有字段都有默认值，默认值对应一台 STS 主臂 + 达妙/STS 混合从臂。

use crate::calibration::NormMode;
use crate::statistics::FpsPolicy;
use openk_protocol::damiao::DamiaoModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ============================================================================
// 顶层配置
// ============================================================================

/// 遥操作会话配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleopConfig {
    /// 控制频率（Hz）
    pub fps: f64,

    /// 主臂
    pub leader: ArmConfig,

    /// 从臂
    pub follower: ArmConfig,

    /// 关节映射
    pub mapping: MappingConfig,

    /// 控制循环
    pub control: ControlConfig,

    /// 录制
    pub recording: RecordingConfig,

    /// 标定
    pub calibration: CalibrationConfig,
}

impl Default for TeleopConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            leader: ArmConfig::default_leader(),
            follower: ArmConfig::default_follower(),
            mapping: MappingConfig::default(),
            control: ControlConfig::default(),
            recording: RecordingConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl TeleopConfig {
    /// 从文件加载并校验
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 保存到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 检查配置的一致性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(invalid(format!("fps must be positive, got {}", self.fps)));
        }
        self.leader.validate("leader")?;
        self.follower.validate("follower")?;
        if self.leader.joints.len() != self.follower.joints.len() {
            return Err(invalid(format!(
                "leader has {} joints but follower has {}",
                self.leader.joints.len(),
                self.follower.joints.len()
            )));
        }
        self.mapping.validate(&self.leader.joints, &self.follower.joints)?;
        self.control.validate()?;
        self.recording.validate()?;
        self.calibration.validate()?;
        Ok(())
    }

    /// tick 周期
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.fps)
    }
}

// ============================================================================
// 机械臂与总线
// ============================================================================

/// 单个机械臂
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmConfig {
    /// 机械臂标识，也是标定文件名
    pub id: String,

    /// 关节名（顺序即关节向量顺序）
    pub joints: Vec<String>,

    /// 总线，按顺序拼接成关节向量
    pub buses: Vec<BusConfig>,

    /// 默认归一化模式
    #[serde(default)]
    pub norm_mode: NormMode,

    /// 按关节覆盖归一化模式
    #[serde(default)]
    pub norm_modes: BTreeMap<String, NormMode>,

    /// 断开时关闭扭矩
    #[serde(default = "default_true")]
    pub disable_torque_on_disconnect: bool,
}

fn default_true() -> bool {
    true
}

const DEFAULT_JOINTS: [&str; 7] = [
    "shoulder_pan",
    "shoulder_lift",
    "shoulder_roll",
    "elbow_flex",
    "wrist_roll",
    "wrist_flex",
    "grip",
];

impl ArmConfig {
    /// STS 主臂：7 个舵机，ID 1..=7
    pub fn default_leader() -> Self {
        Self {
            id: "openk_leader".to_string(),
            joints: DEFAULT_JOINTS.iter().map(|s| s.to_string()).collect(),
            buses: vec![BusConfig::Sts(StsBusConfig {
                transport: StsTransport::Ttl(SerialPortConfig {
                    port: "/dev/ttyUSB0".to_string(),
                    baud_rate: 1_000_000,
                }),
                ids: (1..=7).collect(),
                min_span: default_sts_min_span(),
                fault: FaultConfig::default(),
            })],
            norm_mode: NormMode::RangeM100_100,
            norm_modes: BTreeMap::new(),
            disable_torque_on_disconnect: true,
        }
    }

    /// 混合从臂：达妙 5 轴 + STS 腕部俯仰与夹爪
    pub fn default_follower() -> Self {
        let motors = [
            (DamiaoModel::Dm8009, 0x01, 0x11),
            (DamiaoModel::Dm8009, 0x02, 0x12),
            (DamiaoModel::Dm4340, 0x03, 0x13),
            (DamiaoModel::Dm4340, 0x04, 0x14),
            (DamiaoModel::Dm4310, 0x05, 0x15),
        ]
        .into_iter()
        .map(|(model, slave_id, master_id)| DamiaoMotorConfig {
            model,
            slave_id,
            master_id,
        })
        .collect();

        Self {
            id: "openk_follower".to_string(),
            joints: DEFAULT_JOINTS.iter().map(|s| s.to_string()).collect(),
            buses: vec![
                BusConfig::Damiao(DamiaoBusConfig {
                    transport: CanTransport::SerialBridge(SerialPortConfig {
                        port: "/dev/ttyACM0".to_string(),
                        baud_rate: 921_600,
                    }),
                    motors,
                    mode: DamiaoModeConfig::default(),
                    min_span: default_damiao_min_span(),
                    fault: FaultConfig::default(),
                }),
                BusConfig::Sts(StsBusConfig {
                    transport: StsTransport::Ttl(SerialPortConfig {
                        port: "/dev/ttyUSB1".to_string(),
                        baud_rate: 1_000_000,
                    }),
                    ids: vec![2, 1],
                    min_span: default_sts_min_span(),
                    fault: FaultConfig::default(),
                }),
            ],
            norm_mode: NormMode::RangeM100_100,
            norm_modes: BTreeMap::new(),
            disable_torque_on_disconnect: false,
        }
    }

    /// 执行器总数
    pub fn actuator_count(&self) -> usize {
        self.buses.iter().map(BusConfig::actuator_count).sum()
    }

    /// 每个关节的标定最小量程，按关节向量顺序
    pub fn min_spans(&self) -> Vec<f64> {
        self.buses
            .iter()
            .flat_map(|bus| std::iter::repeat_n(bus.min_span(), bus.actuator_count()))
            .collect()
    }

    /// 关节的归一化模式
    pub fn norm_mode_for(&self, joint: &str) -> NormMode {
        self.norm_modes.get(joint).copied().unwrap_or(self.norm_mode)
    }

    fn validate(&self, role: &str) -> Result<(), ConfigError> {
        if self.id.is_empty() || self.id.contains(['/', '\\']) {
            return Err(invalid(format!("{}: arm id '{}' is not a valid file name", role, self.id)));
        }
        if self.joints.is_empty() {
            return Err(invalid(format!("{}: no joints configured", role)));
        }
        for (i, name) in self.joints.iter().enumerate() {
            if self.joints[..i].contains(name) {
                return Err(invalid(format!("{}: duplicate joint '{}'", role, name)));
            }
        }
        if self.buses.is_empty() {
            return Err(invalid(format!("{}: no buses configured", role)));
        }
        for bus in &self.buses {
            bus.validate(role)?;
        }
        if self.actuator_count() != self.joints.len() {
            return Err(invalid(format!(
                "{}: {} joints but {} actuators",
                role,
                self.joints.len(),
                self.actuator_count()
            )));
        }
        for joint in self.norm_modes.keys() {
            if !self.joints.contains(joint) {
                return Err(invalid(format!("{}: norm_modes names unknown joint '{}'", role, joint)));
            }
        }
        Ok(())
    }
}

/// 总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusConfig {
    Damiao(DamiaoBusConfig),
    Sts(StsBusConfig),
}

impl BusConfig {
    pub fn actuator_count(&self) -> usize {
        match self {
            BusConfig::Damiao(c) => c.motors.len(),
            BusConfig::Sts(c) => c.ids.len(),
        }
    }

    pub fn fault(&self) -> &FaultConfig {
        match self {
            BusConfig::Damiao(c) => &c.fault,
            BusConfig::Sts(c) => &c.fault,
        }
    }

    /// 标定最小量程（该总线的原始单位）
    pub fn min_span(&self) -> f64 {
        match self {
            BusConfig::Damiao(c) => c.min_span,
            BusConfig::Sts(c) => c.min_span,
        }
    }

    fn validate(&self, role: &str) -> Result<(), ConfigError> {
        match self {
            BusConfig::Damiao(c) => {
                if c.motors.is_empty() {
                    return Err(invalid(format!("{}: damiao bus has no motors", role)));
                }
                for (i, m) in c.motors.iter().enumerate() {
                    if m.slave_id == 0 || m.slave_id > 0x0F {
                        return Err(invalid(format!(
                            "{}: damiao slave id 0x{:X} outside 0x01..=0x0F",
                            role, m.slave_id
                        )));
                    }
                    if c.motors[..i].iter().any(|o| o.slave_id == m.slave_id) {
                        return Err(invalid(format!("{}: duplicate damiao slave id 0x{:X}", role, m.slave_id)));
                    }
                }
                if let DamiaoModeConfig::Mit { kp, kd } = c.mode {
                    if !(kp.is_finite() && kd.is_finite() && kp >= 0.0 && kd >= 0.0) {
                        return Err(invalid(format!("{}: invalid MIT gains kp={} kd={}", role, kp, kd)));
                    }
                }
            },
            BusConfig::Sts(c) => {
                if c.ids.is_empty() {
                    return Err(invalid(format!("{}: sts bus has no servos", role)));
                }
                for (i, id) in c.ids.iter().enumerate() {
                    if *id == 0 || *id >= 0xFE || c.ids[..i].contains(id) {
                        return Err(invalid(format!("{}: invalid or duplicate sts id {}", role, id)));
                    }
                }
            },
        }
        let min_span = self.min_span();
        if !(min_span.is_finite() && min_span > 0.0) {
            return Err(invalid(format!("{}: calibration min_span {} must be positive", role, min_span)));
        }
        self.fault().validate(role)
    }
}

/// 达妙总线
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamiaoBusConfig {
    pub transport: CanTransport,
    pub motors: Vec<DamiaoMotorConfig>,
    #[serde(default)]
    pub mode: DamiaoModeConfig,
    /// 标定最小量程（弧度）
    #[serde(default = "default_damiao_min_span")]
    pub min_span: f64,
    #[serde(default)]
    pub fault: FaultConfig,
}

fn default_damiao_min_span() -> f64 {
    0.05
}

/// 单个达妙电机
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DamiaoMotorConfig {
    pub model: DamiaoModel,
    pub slave_id: u16,
    pub master_id: u16,
}

/// 达妙控制模式
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DamiaoModeConfig {
    Mit { kp: f32, kd: f32 },
    PosVel { velocity: f32 },
}

impl Default for DamiaoModeConfig {
    fn default() -> Self {
        DamiaoModeConfig::PosVel { velocity: 5.0 }
    }
}

/// STS 总线
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StsBusConfig {
    pub transport: StsTransport,
    pub ids: Vec<u8>,
    /// 标定最小量程（舵机步数）
    #[serde(default = "default_sts_min_span")]
    pub min_span: f64,
    #[serde(default)]
    pub fault: FaultConfig,
}

fn default_sts_min_span() -> f64 {
    50.0
}

/// CAN 传输
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanTransport {
    /// SocketCAN 接口（Linux）
    SocketCan { interface: String },
    /// USB-CAN 串口桥
    SerialBridge(SerialPortConfig),
}

/// STS 传输
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StsTransport {
    /// TTL 串口直连
    Ttl(SerialPortConfig),
    /// 经 USB-CAN 串口桥上的 CAN 网关
    CanGateway(SerialPortConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortConfig {
    pub port: String,
    pub baud_rate: u32,
}

/// 超时、重试与坏包阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub malformed_threshold: u32,
    pub malformed_window_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10,
            max_retries: 2,
            malformed_threshold: 10,
            malformed_window_ms: 1000,
        }
    }
}

impl FaultConfig {
    fn validate(&self, role: &str) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 || self.malformed_window_ms == 0 {
            return Err(invalid(format!("{}: fault timeouts must be positive", role)));
        }
        Ok(())
    }
}

// ============================================================================
// 映射、控制、录制、标定
// ============================================================================

/// 关节映射
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// 主臂关节名 → 从臂关节名；为空时按下标一一对应
    pub remap: BTreeMap<String, String>,

    /// 从臂关节 → 方向（±1）
    pub direction: BTreeMap<String, f64>,

    /// 单步最大变化（归一化单位）
    pub max_step: Option<f64>,
}

impl MappingConfig {
    fn validate(&self, leader: &[String], follower: &[String]) -> Result<(), ConfigError> {
        for (from, to) in &self.remap {
            if !leader.contains(from) {
                return Err(invalid(format!("remap source '{}' is not a leader joint", from)));
            }
            if !follower.contains(to) {
                return Err(invalid(format!("remap target '{}' is not a follower joint", to)));
            }
        }
        for (joint, sign) in &self.direction {
            if !follower.contains(joint) {
                return Err(invalid(format!("direction names unknown follower joint '{}'", joint)));
            }
            if *sign != 1.0 && *sign != -1.0 {
                return Err(invalid(format!("direction for '{}' must be 1 or -1, got {}", joint, sign)));
            }
        }
        match self.max_step {
            Some(step) if !(step.is_finite() && step > 0.0) => {
                return Err(invalid(format!("max_step must be positive, got {}", step)));
            },
            _ => {},
        }
        Ok(())
    }
}

/// 观测来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    /// 映射前的主臂归一化状态
    #[default]
    Leader,
    /// 写入后回读的从臂位置
    Follower,
}

/// 控制循环
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// 连续失败多少次后停止
    pub max_consecutive_failures: u32,
    /// tick 内的重试次数
    pub in_tick_retries: u32,
    /// 连续超时多少个 tick 后视为致命
    pub overrun_streak_limit: u32,
    pub observation: ObservationSource,
    /// 运行时长（秒），`None` 表示直到取消
    pub duration_s: Option<f64>,
    /// 提升控制线程优先级（需要 `realtime` feature）
    pub realtime: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            in_tick_retries: 1,
            overrun_streak_limit: 30,
            observation: ObservationSource::Leader,
            duration_s: None,
            realtime: false,
        }
    }
}

impl ControlConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_failures == 0 || self.overrun_streak_limit == 0 {
            return Err(invalid("control thresholds must be positive"));
        }
        match self.duration_s {
            Some(d) if !(d.is_finite() && d > 0.0) => {
                return Err(invalid(format!("duration_s must be positive, got {}", d)));
            },
            _ => {},
        }
        Ok(())
    }
}

/// 录制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    /// 数据集根目录
    pub root: PathBuf,
    /// 任务描述
    pub task: String,
    /// 片段数
    pub num_episodes: u32,
    /// 每个片段的目标帧数，`None` 表示由操作员结束
    pub episode_frames: Option<u32>,
    /// 从该片段序号继续录制
    pub resume_from: Option<u32>,
    /// 实测帧率允许的相对误差
    pub fps_tolerance: f64,
    /// 最大间隔 / 周期
    pub max_gap_factor: f64,
    /// 存储线程队列容量
    pub queue_capacity: usize,
    /// 控制线程侧溢出缓冲容量
    pub overflow_capacity: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        let policy = FpsPolicy::default();
        Self {
            enabled: false,
            root: PathBuf::from("datasets/openk"),
            task: "teleoperation".to_string(),
            num_episodes: 1,
            episode_frames: None,
            resume_from: None,
            fps_tolerance: policy.tolerance,
            max_gap_factor: policy.max_gap_factor,
            queue_capacity: 256,
            overflow_capacity: 1024,
        }
    }
}

impl RecordingConfig {
    pub fn fps_policy(&self) -> FpsPolicy {
        FpsPolicy {
            tolerance: self.fps_tolerance,
            max_gap_factor: self.max_gap_factor,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fps_tolerance.is_finite() && self.fps_tolerance > 0.0) {
            return Err(invalid("fps_tolerance must be positive"));
        }
        if !(self.max_gap_factor.is_finite() && self.max_gap_factor >= 1.0) {
            return Err(invalid("max_gap_factor must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be positive"));
        }
        if self.episode_frames == Some(0) || self.num_episodes == 0 {
            return Err(invalid("episode_frames and num_episodes must be positive"));
        }
        Ok(())
    }
}

/// 标定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// 标定文件目录
    pub dir: PathBuf,
    /// 扫描采样上限
    pub max_sweep_samples: u32,
    /// 扫描采样间隔（毫秒）
    pub sample_interval_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("calibration"),
            max_sweep_samples: 20_000,
            sample_interval_ms: 10,
        }
    }
}

impl CalibrationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sweep_samples == 0 {
            return Err(invalid("calibration max_sweep_samples must be positive"));
        }
        Ok(())
    }
}
