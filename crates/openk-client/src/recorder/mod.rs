//! 片段录制
//!
//! - [`EpisodeRecorder`]：同步核心，负责片段生命周期、schema 与帧率检查、落盘
//! - [`RecorderWorker`] / [`RecorderSink`]：把核心放到存储线程，控制线程只做非阻塞投递
//!
//! 片段状态：打开 → 逐帧追加 → 封存（写入数据集）或拒绝。
//! 被拒绝的片段不占用序号，下一个片段复用它。

mod worker;

pub use worker::{RecorderEvent, RecorderSink, RecorderWorker, Sample, SinkStats};

use openk_tools::dataset::Dataset;
use openk_tools::{Episode, EpisodeError, FeatureSchema, FpsPolicy, FpsViolation, Frame, IntervalStats};
use thiserror::Error;
use tracing::{debug, info, warn};

/// 片段被拒绝的原因
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RejectReason {
    #[error("{0}")]
    Fps(#[from] FpsViolation),

    /// 录制期间有帧被丢弃
    #[error("recording degraded: {dropped} frames dropped")]
    Degraded { dropped: u64 },
}

/// 录制错误
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("No episode is open")]
    NoOpenEpisode,

    #[error("Episode {index} is already open")]
    EpisodeAlreadyOpen { index: u32 },

    #[error("Handle for episode {index} does not match the open episode")]
    UnknownHandle { index: u32 },

    /// 帧形状不符；片段保持打开，已有帧不受影响
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(#[source] EpisodeError),

    #[error("Episode requested at {requested} fps but the dataset is {dataset} fps")]
    FpsMismatch { requested: f64, dataset: f64 },

    /// 封存时被拒绝，片段已丢弃
    #[error("Episode {index} rejected: {reason}")]
    Rejected { index: u32, reason: RejectReason },

    #[error("Cannot resume: {0}")]
    Resume(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// 存储线程已退出
    #[error("Recorder worker is gone")]
    WorkerGone,

    #[error("Failed to spawn recorder worker: {0}")]
    Spawn(#[from] std::io::Error),
}

fn storage(e: anyhow::Error) -> RecorderError {
    RecorderError::Storage(format!("{:#}", e))
}

/// 打开片段的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeHandle {
    index: u32,
}

impl EpisodeHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// 封存结果
#[derive(Debug, Clone, PartialEq)]
pub struct SealedEpisode {
    pub index: u32,
    pub frames: usize,
    pub stats: IntervalStats,
}

struct OpenEpisode {
    episode: Episode,
    dropped: u64,
}

/// 同步录制核心
pub struct EpisodeRecorder {
    dataset: Dataset,
    policy: FpsPolicy,
    joint_names: Vec<String>,
    open: Option<OpenEpisode>,
    next_index: u32,
}

impl EpisodeRecorder {
    /// 在数据集末尾继续录制
    pub fn new(dataset: Dataset, joint_names: Vec<String>, policy: FpsPolicy) -> Self {
        let next_index = dataset.next_episode_index();
        info!(
            "Recorder ready at {} (next episode {})",
            dataset.root().display(),
            next_index
        );
        Self {
            dataset,
            policy,
            joint_names,
            open: None,
            next_index,
        }
    }

    /// 从指定序号继续录制；序号必须紧接已有最大序号
    pub fn resume(
        dataset: Dataset,
        from: u32,
        joint_names: Vec<String>,
        policy: FpsPolicy,
    ) -> Result<Self, RecorderError> {
        dataset
            .check_resume(from)
            .map_err(|e| RecorderError::Resume(format!("{:#}", e)))?;
        info!("Resuming dataset {} at episode {}", dataset.root().display(), from);
        Ok(Self::new(dataset, joint_names, policy))
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn into_dataset(self) -> Dataset {
        self.dataset
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// 打开片段中已追加的帧
    pub fn open_frames(&self) -> Option<&[Frame]> {
        self.open.as_ref().map(|o| o.episode.frames.as_slice())
    }

    pub fn start_episode(&mut self, task: &str, target_fps: f64) -> Result<EpisodeHandle, RecorderError> {
        if let Some(open) = &self.open {
            return Err(RecorderError::EpisodeAlreadyOpen {
                index: open.episode.index,
            });
        }
        if (target_fps - self.dataset.fps()).abs() > f64::EPSILON {
            return Err(RecorderError::FpsMismatch {
                requested: target_fps,
                dataset: self.dataset.fps(),
            });
        }
        let index = self.next_index;
        self.open = Some(OpenEpisode {
            episode: Episode::new(index, task, target_fps),
            dropped: 0,
        });
        info!("Episode {} started: '{}' @ {} fps", index, task, target_fps);
        Ok(EpisodeHandle { index })
    }

    /// 追加一帧，返回帧序号
    ///
    /// 第一帧确定数据集 schema（若数据集尚无 schema）。
    pub fn append(&mut self, mut frame: Frame) -> Result<u32, RecorderError> {
        let open = self.open.as_mut().ok_or(RecorderError::NoOpenEpisode)?;

        match self.dataset.schema() {
            Some(schema) => schema
                .check(&frame.observation, &frame.action)
                .map_err(RecorderError::SchemaMismatch)?,
            None => {
                let schema =
                    FeatureSchema::from_frame(self.joint_names.clone(), &frame.observation, &frame.action);
                self.dataset.ensure_schema(&schema).map_err(storage)?;
                debug!("Dataset schema established: {:?}", schema);
            },
        }

        let frame_index = open.episode.frames.len() as u32;
        frame.episode_index = open.episode.index;
        frame.frame_index = frame_index;
        open.episode.frames.push(frame);
        Ok(frame_index)
    }

    /// 记录录制期间被丢弃的帧数；非零时该片段在封存时被拒绝
    pub fn mark_degraded(&mut self, dropped: u64) -> Result<(), RecorderError> {
        let open = self.open.as_mut().ok_or(RecorderError::NoOpenEpisode)?;
        open.dropped += dropped;
        warn!("Episode {} marked degraded ({} frames dropped)", open.episode.index, open.dropped);
        Ok(())
    }

    /// 封存并写入数据集
    ///
    /// 帧率或完整性检查失败时片段被丢弃，返回 `Rejected`，序号留给下一个片段。
    pub fn seal_episode(&mut self, handle: EpisodeHandle) -> Result<SealedEpisode, RecorderError> {
        let open = self.take_open(handle)?;
        let index = open.episode.index;

        if open.dropped > 0 {
            return Err(self.reject(index, RejectReason::Degraded { dropped: open.dropped }));
        }
        let stats = match self.policy.check(&open.episode.timestamps(), open.episode.fps) {
            Ok(stats) => stats,
            Err(violation) => return Err(self.reject(index, violation.into())),
        };

        self.dataset.write_episode(&open.episode).map_err(storage)?;
        self.next_index = index + 1;
        info!(
            "Episode {} sealed: {} frames, {:.2} fps measured",
            index,
            open.episode.len(),
            stats.measured_fps()
        );
        Ok(SealedEpisode {
            index,
            frames: open.episode.len(),
            stats,
        })
    }

    /// 丢弃打开的片段
    pub fn discard_episode(&mut self, handle: EpisodeHandle) -> Result<usize, RecorderError> {
        let open = self.take_open(handle)?;
        info!("Episode {} discarded ({} frames)", open.episode.index, open.episode.len());
        Ok(open.episode.len())
    }

    fn take_open(&mut self, handle: EpisodeHandle) -> Result<OpenEpisode, RecorderError> {
        match &self.open {
            None => Err(RecorderError::NoOpenEpisode),
            Some(open) if open.episode.index != handle.index => {
                Err(RecorderError::UnknownHandle { index: handle.index })
            },
            Some(_) => self.open.take().ok_or(RecorderError::NoOpenEpisode),
        }
    }

    fn reject(&self, index: u32, reason: RejectReason) -> RecorderError {
        warn!("Episode {} rejected: {}", index, reason);
        RecorderError::Rejected { index, reason }
    }
}
