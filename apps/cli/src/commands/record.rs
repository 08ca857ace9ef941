//! record 命令
//!
//! 遥操作的同时把（观测, 动作）按片段写入数据集

use crate::commands::teleop::{confirm_start, print_report, spawn_status_monitor};
use crate::session::{self, TeleopLoop};
use anyhow::{Context, Result};
use clap::Args;
use openk_client::{
    CancelToken, EpisodeRecorder, RecorderEvent, RecorderSink, RecorderWorker, RunLimit,
};
use openk_tools::{Dataset, TeleopConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::spawn_blocking;

/// 等待存储线程应答的时间
const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// 录制命令参数
#[derive(Args, Debug)]
pub struct RecordCommand {
    /// 片段数（覆盖配置）
    #[arg(short, long)]
    pub episodes: Option<u32>,

    /// 任务描述（覆盖配置）
    #[arg(short, long)]
    pub task: Option<String>,

    /// 数据集根目录（覆盖配置）
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// 每个片段的时长（秒）；配置了 episode_frames 时忽略
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// 从该片段序号继续录制（必须紧接已有片段）
    #[arg(long)]
    pub resume_from: Option<u32>,

    /// 跳过所有确认
    #[arg(short, long)]
    pub yes: bool,
}

/// 一次录制会话的参数
#[derive(Debug, Clone)]
struct Plan {
    episodes: u32,
    task: String,
    root: PathBuf,
    limit: RunLimit,
    resume_from: Option<u32>,
    interactive: bool,
}

/// 会话结果
#[derive(Debug, Default)]
struct Outcome {
    sealed: Vec<u32>,
    rejected: u32,
}

impl RecordCommand {
    pub async fn execute(&self, config_path: &Path) -> Result<()> {
        let config = session::load_config(config_path)?;
        let plan = self.plan(&config)?;

        println!("════════════════════════════════════════");
        println!("           录制模式");
        println!("════════════════════════════════════════");
        println!("📁 数据集: {}", plan.root.display());
        println!("📝 任务: {}", plan.task);
        println!("🎬 片段: {}", plan.episodes);
        println!("⚡ 频率: {} Hz", config.fps);
        println!();

        if plan.interactive && !confirm_start()? {
            println!("❌ 操作已取消");
            return Ok(());
        }

        let setup_plan = plan.clone();
        let (control, worker, sink) = spawn_blocking(move || setup_sync(&config, &setup_plan))
            .await
            .context("任务执行失败")??;
        println!("✅ 已连接，数据集就绪");
        println!("💡 提示: 按 Ctrl-C 结束当前片段并停止录制");

        let cancel = control.cancel_token();
        session::cancel_on_ctrl_c(cancel.clone());
        let monitor = spawn_status_monitor(control.status());

        let result = spawn_blocking(move || record_sync(control, worker, sink, cancel, &plan)).await;
        monitor.abort();

        let outcome = result.context("任务执行失败")?.context("录制异常停止")?;
        println!();
        println!("💾 已保存 {} 个片段 {:?}", outcome.sealed.len(), outcome.sealed);
        if outcome.rejected > 0 {
            println!("⚠️ {} 个片段因帧率校验未通过被丢弃", outcome.rejected);
        }
        Ok(())
    }

    fn plan(&self, config: &TeleopConfig) -> Result<Plan> {
        let recording = &config.recording;
        let limit = match recording.episode_frames {
            Some(frames) => RunLimit::ticks(u64::from(frames)),
            None => session::run_limit(self.duration, config)?,
        };
        let episodes = self.episodes.unwrap_or(recording.num_episodes);
        if episodes == 0 {
            anyhow::bail!("❌ 片段数必须为正数");
        }
        Ok(Plan {
            episodes,
            task: self.task.clone().unwrap_or_else(|| recording.task.clone()),
            root: self.root.clone().unwrap_or_else(|| recording.root.clone()),
            limit,
            resume_from: self.resume_from.or(recording.resume_from),
            interactive: !self.yes,
        })
    }
}

fn setup_sync(config: &TeleopConfig, plan: &Plan) -> Result<(TeleopLoop, RecorderWorker, RecorderSink)> {
    let control = session::build_control_loop(config)?;

    let dataset = Dataset::open_or_create(&plan.root, config.fps)
        .with_context(|| format!("打开数据集失败: {}", plan.root.display()))?;
    let names = config.follower.joints.clone();
    let policy = config.recording.fps_policy();
    let recorder = match plan.resume_from {
        Some(from) => EpisodeRecorder::resume(dataset, from, names, policy)?,
        None => EpisodeRecorder::new(dataset, names, policy),
    };
    println!("   下一个片段序号: {}", recorder.next_index());

    let (worker, sink) = RecorderWorker::spawn(
        recorder,
        config.recording.queue_capacity,
        config.recording.overflow_capacity,
    )?;
    Ok((control, worker, sink))
}

fn record_sync(
    mut control: TeleopLoop,
    worker: RecorderWorker,
    mut sink: RecorderSink,
    cancel: CancelToken,
    plan: &Plan,
) -> Result<Outcome> {
    let fps = control.config().fps;
    let mut outcome = Outcome::default();
    let mut recorded = 0;

    while recorded < plan.episodes && !cancel.is_cancelled() {
        sink.start_episode(&plan.task, fps)?;
        let index = match wait_for(&worker)? {
            RecorderEvent::Started { index } => index,
            other => anyhow::bail!("存储线程未能开始片段: {:?}", other),
        };
        println!();
        println!("🔴 录制片段 {} ({}/{})", index, recorded + 1, plan.episodes);

        control.attach_recorder(sink);
        let result = control.connect().and_then(|()| control.run(plan.limit));
        sink = control
            .detach_recorder()
            .ok_or_else(|| anyhow::anyhow!("录制投递端丢失"))?;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                sink.discard()?;
                worker.shutdown()?;
                return Err(e).context(format!("片段 {} 录制失败，已丢弃", index));
            },
        };
        print_report(&report);

        sink.seal()?;
        match wait_for(&worker)? {
            RecorderEvent::Sealed(sealed) => {
                println!(
                    "💾 片段 {} 已保存: {} 帧, 实测 {:.2} Hz",
                    sealed.index,
                    sealed.frames,
                    sealed.stats.measured_fps()
                );
                outcome.sealed.push(sealed.index);
                recorded += 1;
            },
            RecorderEvent::Rejected { index, reason } => {
                println!("⚠️ 片段 {} 被拒绝: {}，将重新录制该序号", index, reason);
                outcome.rejected += 1;
            },
            other => anyhow::bail!("封存片段 {} 失败: {:?}", index, other),
        }

        if recorded < plan.episodes && !cancel.is_cancelled() && plan.interactive {
            let next = inquire::Confirm::new("复位场景后继续录制下一个片段？")
                .with_default(true)
                .prompt()?;
            if !next {
                break;
            }
        }
    }

    let recorder = worker.shutdown()?;
    let dataset = recorder.dataset();
    println!(
        "📁 数据集共 {} 个片段, {} 帧",
        dataset.len(),
        dataset.meta().total_frames()
    );
    Ok(outcome)
}

/// 等待开始/封存的应答；追加失败只打印
fn wait_for(worker: &RecorderWorker) -> Result<RecorderEvent> {
    loop {
        match worker.next_event(EVENT_TIMEOUT) {
            Some(RecorderEvent::AppendFailed { timestamp_us, error }) => {
                println!("⚠️ {} us 处的帧未写入: {}", timestamp_us, error);
            },
            Some(RecorderEvent::Error(message)) => anyhow::bail!("存储线程错误: {}", message),
            Some(event) => return Ok(event),
            None => anyhow::bail!("等待存储线程超时"),
        }
    }
}
