//! # OpenK Client
//!
//! 主从遥操作的上层逻辑：
//!
//! - [`calibration`]：交互式标定流程（中位 + 全行程扫描）
//! - [`mapper`]：主臂归一化向量到从臂命令的映射与截断
//! - [`control`]：控制循环与状态机（`Idle → Connected → Running → Stopping → Idle`）
//! - [`recorder`]：片段录制核心、存储线程与非阻塞投递端
//! - [`replay`]：片段回放
//! - [`pacing`] / [`clock`]：固定周期节拍与可替换时钟
//!
//! ## 示例
//!
//! ```rust,ignore
//! use openk_client::{ControlLoop, JointMapper, LoopConfig, RunLimit};
//! use std::sync::Arc;
//!
//! let mapper = JointMapper::identity(follower_cal.bounds())?;
//! let mut control = ControlLoop::new(
//!     leader_bus,
//!     follower_bus,
//!     Arc::new(leader_cal),
//!     Arc::new(follower_cal),
//!     mapper,
//!     LoopConfig::default(),
//! )?;
//! control.connect()?;
//! let report = control.run(RunLimit::duration(std::time::Duration::from_secs(10)))?;
//! ```

pub mod calibration;
pub mod clock;
pub mod control;
pub mod error;
pub mod mapper;
pub mod pacing;
pub mod recorder;
pub mod replay;

pub use calibration::{CalibrationPrompt, CalibrationSettings, ScriptedPrompt, calibrate_and_save, run_calibration};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use control::{
    AtomicLoopState, CancelToken, ControlLoop, LoopConfig, LoopReport, LoopState, LoopStatus, RunLimit,
    StatusHandle, StopReason,
};
pub use error::{BusRole, ControlError};
pub use mapper::{JointMapper, MapperError};
pub use pacing::{TickPacer, TickTiming};
pub use recorder::{
    EpisodeHandle, EpisodeRecorder, RecorderError, RecorderEvent, RecorderSink, RecorderWorker, RejectReason,
    Sample, SealedEpisode, SinkStats,
};
pub use replay::{ReplayEngine, ReplayError, ReplayReport, ReplayStream, replay, replay_from_dataset};
