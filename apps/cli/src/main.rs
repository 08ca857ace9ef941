//! # OpenK CLI
//!
//! 主从遥操作命令行工具。
//!
//! ```bash
//! # 生成默认配置并检查
//! openk-cli config init
//! openk-cli config check
//!
//! # 标定两条机械臂
//! openk-cli calibrate --arm leader
//! openk-cli calibrate --arm follower
//!
//! # 遥操作 / 录制 / 回放
//! openk-cli teleop --duration 60
//! openk-cli record --episodes 5 --task "pick cube"
//! openk-cli replay --episode 0
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod hardware;
mod prompt;
mod session;

use commands::{CalibrateCommand, ConfigCommand, RecordCommand, ReplayCommand, TeleopCommand};

/// OpenK CLI - 主从遥操作命令行工具
#[derive(Parser, Debug)]
#[command(name = "openk-cli")]
#[command(about = "Leader-follower teleoperation, recording and replay for OpenK arms", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件（默认 <config_dir>/openk/teleop.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 标定一条机械臂
    Calibrate {
        #[command(flatten)]
        args: CalibrateCommand,
    },

    /// 遥操作（不录制）
    Teleop {
        #[command(flatten)]
        args: TeleopCommand,
    },

    /// 遥操作并录制片段
    Record {
        #[command(flatten)]
        args: RecordCommand,
    },

    /// 在从臂上回放片段
    Replay {
        #[command(flatten)]
        args: ReplayCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("openk_cli=info,openk_client=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => commands::config::default_config_path()?,
    };

    match cli.command {
        Commands::Config(cmd) => cmd.execute(&config_path).await,
        Commands::Calibrate { args } => args.execute(&config_path).await,
        Commands::Teleop { args } => args.execute(&config_path).await,
        Commands::Record { args } => args.execute(&config_path).await,
        Commands::Replay { args } => args.execute(&config_path).await,
    }
}
