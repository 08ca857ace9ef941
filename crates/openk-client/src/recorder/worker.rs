//! 存储线程与非阻塞投递端
//!
//! 控制线程只调用 [`RecorderSink::offer`]：通道满时样本进入有界溢出缓冲，
//! 溢出缓冲也满时丢帧，并在封存前把片段标记为降级。

use super::{EpisodeRecorder, RecorderError, RejectReason, SealedEpisode};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded, unbounded};
use openk_protocol::JointState;
use openk_tools::Frame;
use std::collections::VecDeque;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 一个 tick 产生的录制样本
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// 相对会话开始的时间戳（微秒）
    pub timestamp_us: u64,
    pub observation: JointState,
    pub action: JointState,
}

impl From<Sample> for Frame {
    fn from(sample: Sample) -> Self {
        Frame::new(sample.timestamp_us, sample.observation, sample.action)
    }
}

enum RecorderCommand {
    Start { task: String, fps: f64 },
    Frame(Sample),
    Degraded { dropped: u64 },
    Seal,
    Discard,
    Shutdown,
}

/// 存储线程上报的事件
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Started { index: u32 },
    Sealed(SealedEpisode),
    Rejected { index: u32, reason: RejectReason },
    /// 单帧追加失败，片段保持打开
    AppendFailed { timestamp_us: u64, error: String },
    Error(String),
}

/// 投递统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub offered: u64,
    pub overflowed: u64,
    pub dropped: u64,
}

/// 控制线程持有的投递端
pub struct RecorderSink {
    tx: Sender<RecorderCommand>,
    overflow: VecDeque<Sample>,
    overflow_capacity: usize,
    stats: SinkStats,
    backpressure: bool,
    active: bool,
}

impl RecorderSink {
    /// 打开新片段（阻塞发送，在循环开始前调用）
    pub fn start_episode(&mut self, task: &str, fps: f64) -> Result<(), RecorderError> {
        self.overflow.clear();
        self.stats = SinkStats::default();
        self.backpressure = false;
        self.send(RecorderCommand::Start {
            task: task.to_string(),
            fps,
        })?;
        self.active = true;
        Ok(())
    }

    /// 非阻塞投递一个样本
    pub fn offer(&mut self, sample: Sample) {
        if !self.active {
            return;
        }
        self.stats.offered += 1;
        self.drain_overflow();

        // 溢出缓冲非空时新样本排在其后，保证顺序
        let sample = if self.overflow.is_empty() {
            match self.tx.try_send(RecorderCommand::Frame(sample)) {
                Ok(()) => return,
                Err(TrySendError::Full(RecorderCommand::Frame(sample))) => sample,
                Err(TrySendError::Full(_)) => return,
                Err(TrySendError::Disconnected(_)) => {
                    self.stats.dropped += 1;
                    error!("Recorder worker is gone, dropping frame");
                    return;
                },
            }
        } else {
            sample
        };

        if self.overflow.len() < self.overflow_capacity {
            if !self.backpressure {
                warn!("Recorder queue is full, buffering frames (backpressure)");
                self.backpressure = true;
            }
            self.stats.overflowed += 1;
            self.overflow.push_back(sample);
        } else {
            self.stats.dropped += 1;
            warn!(
                "Recorder overflow buffer full ({} frames), dropping frame at {} us",
                self.overflow_capacity, sample.timestamp_us
            );
        }
    }

    fn drain_overflow(&mut self) {
        while let Some(sample) = self.overflow.pop_front() {
            match self.tx.try_send(RecorderCommand::Frame(sample)) {
                Ok(()) => {},
                Err(TrySendError::Full(RecorderCommand::Frame(sample))) => {
                    self.overflow.push_front(sample);
                    return;
                },
                Err(_) => {
                    self.stats.dropped += 1;
                    return;
                },
            }
        }
        if self.backpressure {
            debug!("Recorder backpressure cleared");
            self.backpressure = false;
        }
    }

    /// 把溢出缓冲阻塞地送出
    pub fn flush(&mut self) -> Result<(), RecorderError> {
        while let Some(sample) = self.overflow.pop_front() {
            self.send(RecorderCommand::Frame(sample))?;
        }
        Ok(())
    }

    /// 封存当前片段；结果以 [`RecorderEvent`] 上报
    pub fn seal(&mut self) -> Result<(), RecorderError> {
        if !self.active {
            return Err(RecorderError::NoOpenEpisode);
        }
        self.flush()?;
        if self.stats.dropped > 0 {
            self.send(RecorderCommand::Degraded {
                dropped: self.stats.dropped,
            })?;
        }
        self.active = false;
        self.send(RecorderCommand::Seal)
    }

    pub fn discard(&mut self) -> Result<(), RecorderError> {
        if !self.active {
            return Err(RecorderError::NoOpenEpisode);
        }
        self.overflow.clear();
        self.active = false;
        self.send(RecorderCommand::Discard)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// 本片段是否已丢帧
    pub fn is_degraded(&self) -> bool {
        self.stats.dropped > 0
    }

    pub fn buffered(&self) -> usize {
        self.overflow.len()
    }

    fn send(&self, command: RecorderCommand) -> Result<(), RecorderError> {
        self.tx.send(command).map_err(|_| RecorderError::WorkerGone)
    }
}

/// 存储线程
pub struct RecorderWorker {
    tx: Sender<RecorderCommand>,
    events: Receiver<RecorderEvent>,
    handle: Option<JoinHandle<EpisodeRecorder>>,
}

impl RecorderWorker {
    /// 启动存储线程，返回线程句柄和投递端
    pub fn spawn(
        recorder: EpisodeRecorder,
        queue_capacity: usize,
        overflow_capacity: usize,
    ) -> Result<(Self, RecorderSink), RecorderError> {
        let (tx, rx) = bounded(queue_capacity.max(1));
        let (event_tx, events) = unbounded();

        let handle = std::thread::Builder::new()
            .name("openk-recorder".into())
            .spawn(move || storage_loop(recorder, rx, event_tx))?;
        info!("Recorder worker started (queue {}, overflow {})", queue_capacity, overflow_capacity);

        let sink = RecorderSink {
            tx: tx.clone(),
            overflow: VecDeque::with_capacity(overflow_capacity),
            overflow_capacity,
            stats: SinkStats::default(),
            backpressure: false,
            active: false,
        };
        Ok((
            Self {
                tx,
                events,
                handle: Some(handle),
            },
            sink,
        ))
    }

    pub fn events(&self) -> &Receiver<RecorderEvent> {
        &self.events
    }

    /// 等待下一个事件
    pub fn next_event(&self, timeout: Duration) -> Option<RecorderEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// 取出所有已到达的事件
    pub fn drain_events(&self) -> Vec<RecorderEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return out,
            }
        }
    }

    /// 停止线程并取回录制核心；打开的片段被丢弃
    pub fn shutdown(mut self) -> Result<EpisodeRecorder, RecorderError> {
        let _ = self.tx.send(RecorderCommand::Shutdown);
        let handle = self.handle.take().ok_or(RecorderError::WorkerGone)?;
        handle.join().map_err(|_| RecorderError::WorkerGone)
    }
}

impl Drop for RecorderWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(RecorderCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

fn storage_loop(
    mut recorder: EpisodeRecorder,
    rx: Receiver<RecorderCommand>,
    events: Sender<RecorderEvent>,
) -> EpisodeRecorder {
    let mut current = None;

    for command in rx.iter() {
        let event = match command {
            RecorderCommand::Start { task, fps } => match recorder.start_episode(&task, fps) {
                Ok(handle) => {
                    current = Some(handle);
                    Some(RecorderEvent::Started { index: handle.index() })
                },
                Err(e) => Some(RecorderEvent::Error(e.to_string())),
            },
            RecorderCommand::Frame(sample) => {
                let timestamp_us = sample.timestamp_us;
                match recorder.append(sample.into()) {
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Frame at {} us not recorded: {}", timestamp_us, e);
                        Some(RecorderEvent::AppendFailed {
                            timestamp_us,
                            error: e.to_string(),
                        })
                    },
                }
            },
            RecorderCommand::Degraded { dropped } => match recorder.mark_degraded(dropped) {
                Ok(()) => None,
                Err(e) => Some(RecorderEvent::Error(e.to_string())),
            },
            RecorderCommand::Seal => match current.take() {
                Some(handle) => Some(match recorder.seal_episode(handle) {
                    Ok(sealed) => RecorderEvent::Sealed(sealed),
                    Err(RecorderError::Rejected { index, reason }) => RecorderEvent::Rejected { index, reason },
                    Err(e) => {
                        error!("Failed to seal episode {}: {}", handle.index(), e);
                        RecorderEvent::Error(e.to_string())
                    },
                }),
                None => Some(RecorderEvent::Error(RecorderError::NoOpenEpisode.to_string())),
            },
            RecorderCommand::Discard => match current.take() {
                Some(handle) => recorder
                    .discard_episode(handle)
                    .err()
                    .map(|e| RecorderEvent::Error(e.to_string())),
                None => None,
            },
            RecorderCommand::Shutdown => break,
        };

        if let Some(event) = event {
            let _ = events.send(event);
        }
    }

    if let Some(handle) = current {
        warn!("Recorder shutting down with episode {} open, discarding", handle.index());
        let _ = recorder.discard_episode(handle);
    }
    info!("Recorder worker stopped");
    recorder
}
