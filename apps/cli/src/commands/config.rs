//! 配置管理命令
//!
//! 生成、检查和显示遥操作配置文件

use anyhow::{Context, Result};
use clap::Subcommand;
use openk_tools::TeleopConfig;
use openk_tools::config::BusConfig;
use std::path::{Path, PathBuf};

/// 默认配置文件路径：`<config_dir>/openk/teleop.toml`
pub fn default_config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("无法确定配置目录"))?;
    path.push("openk");
    path.push("teleop.toml");
    Ok(path)
}

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 写入默认配置
    Init {
        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },

    /// 加载并校验配置
    Check,

    /// 打印配置（TOML）
    Show,
}

impl ConfigCommand {
    pub async fn execute(self, path: &Path) -> Result<()> {
        match self {
            ConfigCommand::Init { force } => init_(path, force),
            ConfigCommand::Check => check_(path),
            ConfigCommand::Show => show_(path),
        }
    }
}

fn init_(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("❌ 配置文件已存在: {}（使用 --force 覆盖）", path.display());
    }
    TeleopConfig::default()
        .save_to_file(path)
        .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
    println!("✅ 已写入默认配置: {}", path.display());
    println!("   请按实际接线修改串口、CAN 接口和执行器 ID");
    Ok(())
}

fn check_(path: &Path) -> Result<()> {
    let config = crate::session::load_config(path)?;

    println!("配置文件: {}", path.display());
    println!("  频率: {} Hz", config.fps);
    for (role, arm) in [("主臂", &config.leader), ("从臂", &config.follower)] {
        println!("  {}: {} ({} 个关节)", role, arm.id, arm.joints.len());
        for bus in &arm.buses {
            match bus {
                BusConfig::Damiao(c) => println!("    - damiao × {}", c.motors.len()),
                BusConfig::Sts(c) => println!("    - sts × {}", c.ids.len()),
            }
        }
    }
    if !config.mapping.remap.is_empty() {
        println!("  重映射: {:?}", config.mapping.remap);
    }
    if let Some(step) = config.mapping.max_step {
        println!("  单步限幅: {}", step);
    }
    println!("  观测来源: {:?}", config.control.observation);
    println!("  数据集: {}", config.recording.root.display());
    println!("  标定目录: {}", config.calibration.dir.display());
    println!("✅ 配置有效");
    Ok(())
}

fn show_(path: &Path) -> Result<()> {
    let config = crate::session::load_config(path)?;
    let content = toml::to_string_pretty(&config).context("序列化配置失败")?;
    println!("{}", content);
    Ok(())
}
