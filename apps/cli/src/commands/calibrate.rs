//! calibrate 命令
//!
//! 关闭扭矩后由操作员摆中位、扫行程，结果写入标定目录

use crate::hardware::open_arm;
use crate::prompt::InquirePrompt;
use crate::session;
use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use openk_client::{BusRole, CalibrationSettings, MonotonicClock, calibrate_and_save};
use openk_tools::TeleopConfig;
use openk_tools::config::ArmConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::spawn_blocking;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmRole {
    Leader,
    Follower,
}

/// 标定命令参数
#[derive(Args, Debug)]
pub struct CalibrateCommand {
    /// 标定哪条机械臂
    #[arg(short, long, value_enum)]
    pub arm: ArmRole,

    /// 覆盖已有标定时不再确认
    #[arg(long)]
    pub force: bool,
}

impl CalibrateCommand {
    pub async fn execute(&self, config_path: &Path) -> Result<()> {
        let config = session::load_config(config_path)?;
        let arm = match self.arm {
            ArmRole::Leader => config.leader.clone(),
            ArmRole::Follower => config.follower.clone(),
        };

        let store = session::calibration_store(&config);
        if store.exists(&arm.id) && !self.force {
            let overwrite = inquire::Confirm::new(&format!("'{}' 已有标定，确定要覆盖吗？", arm.id))
                .with_default(false)
                .prompt()?;
            if !overwrite {
                println!("❌ 操作已取消");
                return Ok(());
            }
        }

        let settings = settings_for(&config, &arm, self.arm);
        let result = spawn_blocking(move || calibrate_sync(config, arm, settings))
            .await
            .context("标定任务执行失败")?;

        let path = result?;
        println!("💾 标定已保存: {}", path.display());
        Ok(())
    }
}

/// 从配置推导标定参数；从臂方向取自映射配置
fn settings_for(config: &TeleopConfig, arm: &ArmConfig, role: ArmRole) -> CalibrationSettings {
    let signs = arm
        .joints
        .iter()
        .map(|joint| match role {
            ArmRole::Follower if config.mapping.direction.get(joint) == Some(&-1.0) => -1,
            _ => 1,
        })
        .collect();
    CalibrationSettings {
        role: match role {
            ArmRole::Leader => BusRole::Leader,
            ArmRole::Follower => BusRole::Follower,
        },
        min_spans: arm.min_spans(),
        max_samples: config.calibration.max_sweep_samples,
        sample_interval: Duration::from_millis(config.calibration.sample_interval_ms),
        norm_modes: arm.joints.iter().map(|joint| arm.norm_mode_for(joint)).collect(),
        signs,
    }
}

fn calibrate_sync(config: TeleopConfig, arm: ArmConfig, settings: CalibrationSettings) -> Result<PathBuf> {
    let layout = session::layout(&arm)?;
    let store = session::calibration_store(&config);
    let mut bus = open_arm(&arm)?;
    let mut prompt = InquirePrompt::new();

    let (set, path) = calibrate_and_save(
        &mut bus,
        &layout,
        &arm.id,
        &settings,
        &mut prompt,
        &MonotonicClock::new(),
        &store,
    )
    .with_context(|| format!("标定 '{}' 失败", arm.id))?;

    println!("✅ 标定完成:");
    for record in &set.records {
        println!(
            "   {:<16} offset={:>9.2} range=[{:>9.2}, {:>9.2}] sign={:+} {:?}",
            record.joint, record.offset, record.range_min, record.range_max, record.sign, record.norm_mode
        );
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openk_tools::NormMode;

    #[test]
    fn test_follower_signs_follow_direction_map() {
        let mut config = TeleopConfig::default();
        let joint = config.follower.joints[1].clone();
        config.mapping.direction.insert(joint, -1.0);

        let follower = config.follower.clone();
        let settings = settings_for(&config, &follower, ArmRole::Follower);
        assert_eq!(settings.role, BusRole::Follower);
        assert_eq!(settings.signs[1], -1);
        assert!(settings.signs.iter().enumerate().all(|(i, &s)| i == 1 || s == 1));

        // 主臂始终为正方向
        let leader = config.leader.clone();
        let settings = settings_for(&config, &leader, ArmRole::Leader);
        assert!(settings.signs.iter().all(|&s| s == 1));
    }

    #[test]
    fn test_norm_modes_follow_arm_config() {
        let mut config = TeleopConfig::default();
        let grip = config.leader.joints.last().unwrap().clone();
        config.leader.norm_modes.insert(grip, NormMode::Range0_100);
        let leader = config.leader.clone();
        let settings = settings_for(&config, &leader, ArmRole::Leader);
        assert_eq!(settings.norm_modes.last(), Some(&NormMode::Range0_100));
        assert_eq!(settings.norm_modes.len(), leader.joints.len());
        assert_eq!(settings.min_spans, leader.min_spans());
    }

    #[test]
    fn test_follower_min_spans_are_per_bus() {
        let config = TeleopConfig::default();
        let follower = config.follower.clone();
        let settings = settings_for(&config, &follower, ArmRole::Follower);
        // 达妙关节以弧度计，STS 关节以步数计
        assert_eq!(settings.min_spans[0], 0.05);
        assert_eq!(settings.min_spans[6], 50.0);
        assert_eq!(settings.min_spans.len(), follower.joints.len());
    }
}
