//! 按配置打开物理总线

use anyhow::{Context, Result};
use openk_bus::{
    ActuatorBus, CanAdapter, CanGatewayLink, CompositeBus, DamiaoBus, DamiaoControlMode, DamiaoMotor, FaultPolicy,
    SerialCanAdapter, SerialPortLink, StsBus, TtlLink,
};
use openk_tools::config::{
    ArmConfig, BusConfig, CanTransport, DamiaoBusConfig, DamiaoModeConfig, FaultConfig, SerialPortConfig,
    StsBusConfig, StsTransport,
};
use std::time::Duration;
use tracing::info;

/// 机械臂背后的总线（单条或复合）
pub type ArmBus = Box<dyn ActuatorBus + Send>;

/// 打开一条机械臂的所有总线
///
/// 只有一条总线时直接返回，多条时按配置顺序拼成 [`CompositeBus`]。
pub fn open_arm(arm: &ArmConfig) -> Result<ArmBus> {
    let mut segments = Vec::with_capacity(arm.buses.len());
    for bus in &arm.buses {
        segments.push(open_bus(bus).with_context(|| format!("打开 '{}' 的总线失败", arm.id))?);
    }
    if segments.len() == 1 {
        if let Some(bus) = segments.pop() {
            return Ok(bus);
        }
    }
    Ok(Box::new(CompositeBus::new(segments)))
}

fn open_bus(config: &BusConfig) -> Result<ArmBus> {
    match config {
        BusConfig::Damiao(c) => open_damiao(c),
        BusConfig::Sts(c) => open_sts(c),
    }
}

fn open_damiao(config: &DamiaoBusConfig) -> Result<ArmBus> {
    let adapter = open_can(&config.transport)?;
    let motors = config
        .motors
        .iter()
        .map(|m| DamiaoMotor::new(m.model, m.slave_id, m.master_id))
        .collect::<Vec<_>>();
    info!("Damiao bus: {} motors", motors.len());
    Ok(Box::new(DamiaoBus::new(
        adapter,
        motors,
        control_mode(&config.mode),
        fault_policy(&config.fault),
    )))
}

fn open_sts(config: &StsBusConfig) -> Result<ArmBus> {
    let policy = fault_policy(&config.fault);
    let ids = config.ids.clone();
    info!("STS bus: servos {:?}", ids);
    match &config.transport {
        StsTransport::Ttl(port) => {
            let link = TtlLink::new(open_serial(port)?);
            Ok(Box::new(StsBus::new(link, ids, policy)))
        },
        StsTransport::CanGateway(port) => {
            let link = CanGatewayLink::new(SerialCanAdapter::new(open_serial(port)?));
            Ok(Box::new(StsBus::new(link, ids, policy)))
        },
    }
}

fn open_can(transport: &CanTransport) -> Result<Box<dyn CanAdapter + Send>> {
    match transport {
        CanTransport::SocketCan { interface } => open_socketcan(interface),
        CanTransport::SerialBridge(port) => Ok(Box::new(SerialCanAdapter::new(open_serial(port)?))),
    }
}

#[cfg(target_os = "linux")]
fn open_socketcan(interface: &str) -> Result<Box<dyn CanAdapter + Send>> {
    let adapter = openk_bus::SocketCanAdapter::new(interface)
        .with_context(|| format!("打开 SocketCAN 接口失败: {}", interface))?;
    info!("SocketCAN interface {} opened", interface);
    Ok(Box::new(adapter))
}

#[cfg(not(target_os = "linux"))]
fn open_socketcan(interface: &str) -> Result<Box<dyn CanAdapter + Send>> {
    anyhow::bail!("SocketCAN ({}) 仅在 Linux 上可用，请改用 serial_bridge", interface)
}

fn open_serial(port: &SerialPortConfig) -> Result<SerialPortLink> {
    SerialPortLink::open(&port.port, port.baud_rate)
        .with_context(|| format!("打开串口失败: {} @ {}", port.port, port.baud_rate))
}

pub fn fault_policy(config: &FaultConfig) -> FaultPolicy {
    FaultPolicy {
        timeout: Duration::from_millis(config.timeout_ms),
        max_retries: config.max_retries,
        malformed_threshold: config.malformed_threshold,
        malformed_window: Duration::from_millis(config.malformed_window_ms),
    }
}

fn control_mode(config: &DamiaoModeConfig) -> DamiaoControlMode {
    match *config {
        DamiaoModeConfig::Mit { kp, kd } => DamiaoControlMode::Mit { kp, kd },
        DamiaoModeConfig::PosVel { velocity } => DamiaoControlMode::PosVel { velocity },
    }
}
