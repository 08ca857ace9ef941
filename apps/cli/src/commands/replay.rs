//! replay 命令
//!
//! 按片段帧率把录制的动作发送给从臂

use crate::hardware::open_arm;
use crate::session;
use anyhow::{Context, Result};
use clap::Args;
use openk_client::{LoopConfig, ReplayEngine, StopReason, replay_from_dataset};
use openk_tools::Dataset;
use std::path::{Path, PathBuf};
use tokio::task::spawn_blocking;

/// 回放命令参数
#[derive(Args, Debug)]
pub struct ReplayCommand {
    /// 片段序号
    #[arg(short, long)]
    pub episode: u32,

    /// 数据集根目录（覆盖配置）
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// 回放前不确认
    #[arg(short, long)]
    pub yes: bool,
}

impl ReplayCommand {
    pub async fn execute(&self, config_path: &Path) -> Result<()> {
        let config = session::load_config(config_path)?;
        let root = self.root.clone().unwrap_or_else(|| config.recording.root.clone());

        // === 1. 加载片段（运动前完成所有校验） ===

        let dataset = Dataset::open(&root).with_context(|| format!("打开数据集失败: {}", root.display()))?;
        let stream = replay_from_dataset(&dataset, self.episode)
            .with_context(|| format!("加载片段 {} 失败", self.episode))?;

        println!("════════════════════════════════════════");
        println!("           回放模式");
        println!("════════════════════════════════════════");
        println!();
        println!("📁 数据集: {}", root.display());
        println!("🎬 片段: {} ({} 帧 @ {} Hz)", self.episode, stream.len(), stream.fps());
        println!("🦾 从臂: {}", config.follower.id);
        println!();

        // === 2. 安全确认 ===

        if !self.yes {
            let confirmed = inquire::Confirm::new("即将开始回放，确定要继续吗？")
                .with_default(false)
                .prompt()?;
            if !confirmed {
                println!("❌ 操作已取消");
                return Ok(());
            }
        }

        // === 3. 打开从臂 ===

        let calibration = session::load_calibration(&config, &config.follower)?;
        let loop_config = LoopConfig::from(&config);
        let follower_config = config.follower.clone();
        let mut engine = spawn_blocking(move || -> Result<_> {
            let follower = open_arm(&follower_config)?;
            Ok(ReplayEngine::new(follower, calibration, &loop_config)?)
        })
        .await
        .context("任务执行失败")??;
        println!("✅ 已连接");
        println!("💡 提示: 按 Ctrl-C 可随时停止回放");

        session::cancel_on_ctrl_c(engine.cancel_token());

        // === 4. 回放 ===

        let report = spawn_blocking(move || engine.run(stream))
            .await
            .context("任务执行失败")?
            .context("回放失败")?;

        println!();
        match report.stop_reason {
            StopReason::LimitReached => println!("✅ 回放完成"),
            StopReason::Cancelled => println!("⚠️ 回放被用户中断"),
        }
        println!("   已发送: {} 帧 (跳过 {})", report.frames_sent, report.skipped);
        println!("   超时: {}", report.overruns);
        println!("   用时: {:.2}s", report.elapsed.as_secs_f64());
        Ok(())
    }
}
