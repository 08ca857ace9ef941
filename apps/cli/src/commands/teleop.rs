//! teleop 命令
//!
//! 主臂带动从臂，不录制

use crate::session::{self, TeleopLoop};
use anyhow::{Context, Result};
use clap::Args;
use openk_client::{LoopReport, LoopState, StatusHandle, StopReason};
use std::path::Path;
use std::time::Duration;
use tokio::task::{JoinHandle, spawn_blocking};

/// 遥操作命令参数
#[derive(Args, Debug)]
pub struct TeleopCommand {
    /// 运行时长（秒），不指定时使用配置，直到 Ctrl-C
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// 跳过开始前的确认
    #[arg(short, long)]
    pub yes: bool,
}

impl TeleopCommand {
    pub async fn execute(&self, config_path: &Path) -> Result<()> {
        let config = session::load_config(config_path)?;
        let limit = session::run_limit(self.duration, &config)?;

        println!("════════════════════════════════════════");
        println!("           遥操作模式");
        println!("════════════════════════════════════════");
        println!("🦾 主臂: {}  →  从臂: {}", config.leader.id, config.follower.id);
        println!("⚡ 频率: {} Hz", config.fps);
        if config.recording.enabled {
            println!("💡 配置中启用了录制，teleop 不会写入数据集，请使用 `openk-cli record`");
        }
        println!();

        if !self.yes && !confirm_start()? {
            println!("❌ 操作已取消");
            return Ok(());
        }

        let mut control = spawn_blocking(move || -> Result<TeleopLoop> {
            let mut control = session::build_control_loop(&config)?;
            control.connect().context("连接机械臂失败")?;
            Ok(control)
        })
        .await
        .context("任务执行失败")??;
        println!("✅ 已连接");
        println!("💡 提示: 按 Ctrl-C 可随时停止");

        session::cancel_on_ctrl_c(control.cancel_token());
        let monitor = spawn_status_monitor(control.status());

        let result = spawn_blocking(move || control.run(limit)).await;
        monitor.abort();

        let report = result.context("任务执行失败")?.context("遥操作异常停止")?;
        print_report(&report);
        Ok(())
    }
}

pub(crate) fn confirm_start() -> Result<bool> {
    let confirmed = inquire::Confirm::new("从臂将跟随主臂运动，确定要开始吗？")
        .with_default(false)
        .prompt()?;
    Ok(confirmed)
}

/// 每秒打印一次循环状态
pub(crate) fn spawn_status_monitor(status: StatusHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await;
        loop {
            interval.tick().await;
            let snapshot = status.load();
            if snapshot.state != LoopState::Running {
                continue;
            }
            tracing::info!(
                "tick {} | overruns {} | clamps {} | failures L{} F{} | recorder dropped {}",
                snapshot.tick,
                snapshot.overruns,
                snapshot.clamp_events,
                snapshot.leader_failures,
                snapshot.follower_failures,
                snapshot.recorder_dropped
            );
        }
    })
}

pub(crate) fn print_report(report: &LoopReport) {
    println!();
    match report.stop_reason {
        StopReason::LimitReached => println!("✅ 已达到时长限制"),
        StopReason::Cancelled => println!("🛑 已停止"),
    }
    println!("   tick: {} (跳过 {})", report.ticks, report.skipped_ticks);
    println!("   超时: {}", report.overruns);
    println!("   限幅: {}", report.clamp_events);
    println!(
        "   总线失败: 主臂 {} / 从臂 {}",
        report.leader_failures, report.follower_failures
    );
    if report.recorder_dropped > 0 {
        println!("   ⚠️ 录制丢弃样本: {}", report.recorder_dropped);
    }
    println!("   用时: {:.2}s", report.elapsed.as_secs_f64());
}

