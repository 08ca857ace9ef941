//! # OpenK Tools - 共享数据结构与持久化
//!
//! **依赖原则**: 只依赖 `openk-protocol`，避免依赖 `openk-bus` / `openk-client`
//!
//! ## 包含模块
//!
//! - `calibration` - 标定记录、原始值 ↔ 归一化值、JSON 标定文件
//! - `episode` - 帧、片段与特征 schema（纯数据结构）
//! - `dataset` - 数据集目录布局与片段文件格式
//! - `statistics` - 帧间隔统计与帧率检查（纯函数）
//! - `config` - TOML 遥操作配置

// ⚠️ 禁止引入硬件相关 crate
// use openk_bus::*;  // ❌ 禁止

pub mod calibration;
pub mod config;
pub mod dataset;
pub mod episode;
pub mod statistics;

// 重新导出常用类型
pub use calibration::{CalibrationError, CalibrationRecord, CalibrationSet, CalibrationStore, NormMode};
pub use config::{ConfigError, ObservationSource, TeleopConfig};
pub use dataset::{Dataset, DatasetMeta, EpisodeSummary};
pub use episode::{Episode, EpisodeError, FeatureSchema, FieldShape, Frame};
pub use statistics::{FpsPolicy, FpsViolation, IntervalStats};
