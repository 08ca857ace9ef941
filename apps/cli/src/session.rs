//! 命令共用的会话准备：加载配置与标定、打开总线、组装控制循环

use crate::hardware::{ArmBus, open_arm};
use anyhow::{Context, Result};
use openk_bus::ActuatorBus;
use openk_client::{CancelToken, ControlLoop, JointMapper, LoopConfig, RunLimit};
use openk_protocol::JointLayout;
use openk_tools::config::ArmConfig;
use openk_tools::{CalibrationSet, CalibrationStore, TeleopConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub type TeleopLoop = ControlLoop<ArmBus, ArmBus>;

pub fn load_config(path: &Path) -> Result<TeleopConfig> {
    if !path.exists() {
        anyhow::bail!(
            "❌ 配置文件不存在: {}\n   先运行 `openk-cli config init` 生成默认配置",
            path.display()
        );
    }
    TeleopConfig::load_from_file(path).with_context(|| format!("加载配置失败: {}", path.display()))
}

pub fn layout(arm: &ArmConfig) -> Result<JointLayout> {
    JointLayout::new(arm.joints.iter().cloned()).with_context(|| format!("'{}' 的关节名无效", arm.id))
}

pub fn calibration_store(config: &TeleopConfig) -> CalibrationStore {
    CalibrationStore::new(&config.calibration.dir)
}

/// 加载并按布局对齐标定
pub fn load_calibration(config: &TeleopConfig, arm: &ArmConfig) -> Result<Arc<CalibrationSet>> {
    let store = calibration_store(config);
    let set = store.load_for(&arm.id, &layout(arm)?).with_context(|| {
        format!(
            "加载 '{}' 的标定失败（{}），请先运行 `openk-cli calibrate`",
            arm.id,
            store.path_for(&arm.id).display()
        )
    })?;
    Ok(Arc::new(set))
}

/// 打开两条机械臂并组装控制循环
pub fn build_control_loop(config: &TeleopConfig) -> Result<TeleopLoop> {
    let leader_calibration = load_calibration(config, &config.leader)?;
    let follower_calibration = load_calibration(config, &config.follower)?;
    let mapper = JointMapper::from_layouts(
        &layout(&config.leader)?,
        &layout(&config.follower)?,
        &config.mapping.remap,
        follower_calibration.bounds(),
    )
    .and_then(|m| m.with_max_step(config.mapping.max_step))
    .context("构建关节映射失败")?;

    println!("⏳ 打开总线...");
    let leader = open_arm(&config.leader)?;
    let follower = open_arm(&config.follower)?;
    println!("✅ 主臂 {} 个关节，从臂 {} 个关节", leader.len(), follower.len());

    let control = ControlLoop::new(
        leader,
        follower,
        leader_calibration,
        follower_calibration,
        mapper,
        LoopConfig::from(config),
    )
    .context("组装控制循环失败")?;
    Ok(control)
}

/// 命令行覆盖优先，其次配置中的时长
pub fn run_limit(duration_s: Option<f64>, config: &TeleopConfig) -> Result<RunLimit> {
    match duration_s.or(config.control.duration_s) {
        Some(d) if d.is_finite() && d > 0.0 => Ok(RunLimit::duration(Duration::from_secs_f64(d))),
        Some(d) => anyhow::bail!("❌ 时长必须为正数，当前: {}", d),
        None => Ok(RunLimit::unbounded()),
    }
}

/// Ctrl-C 时触发取消
pub fn cancel_on_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            println!("🛑 收到停止信号，正在停止...");
            token.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_limit_prefers_command_line() {
        let mut config = TeleopConfig::default();
        config.control.duration_s = Some(10.0);
        assert_eq!(
            run_limit(Some(2.0), &config).unwrap(),
            RunLimit::duration(Duration::from_secs(2))
        );
        assert_eq!(
            run_limit(None, &config).unwrap(),
            RunLimit::duration(Duration::from_secs(10))
        );
        config.control.duration_s = None;
        assert_eq!(run_limit(None, &config).unwrap(), RunLimit::unbounded());
        assert!(run_limit(Some(-1.0), &config).is_err());
    }

    #[test]
    fn test_missing_config_mentions_init() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("config init"));
    }

    #[test]
    fn test_missing_calibration_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TeleopConfig::default();
        config.calibration.dir = dir.path().to_path_buf();
        let err = load_calibration(&config, &config.leader).unwrap_err();
        assert!(format!("{:#}", err).contains("calibrate"));
    }
}
