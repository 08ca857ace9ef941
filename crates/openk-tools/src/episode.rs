//! # 帧与片段
//!
//! 纯数据结构：控制循环每个 tick 产生一帧（观测 + 动作），
//! 同一片段的帧共享片段序号、任务描述与声明帧率。

use crate::statistics::IntervalStats;
use openk_protocol::JointState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// 片段内容相关错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EpisodeError {
    /// 帧形状与数据集 schema 不一致
    #[error("Schema mismatch on {field}: expected {expected:?}, got {actual:?}")]
    SchemaMismatch {
        field: &'static str,
        expected: FieldShape,
        actual: FieldShape,
    },

    /// 帧序号不连续
    #[error("Episode {episode_index} is not contiguous: expected frame {expected}, found {found}")]
    NonContiguous {
        episode_index: u32,
        expected: u32,
        found: u32,
    },

    /// 帧不属于该片段
    #[error("Frame belongs to episode {found}, expected {expected}")]
    WrongEpisode { expected: u32, found: u32 },

    /// 声明帧率不是有限正数
    #[error("Episode {episode_index} declares an invalid fps of {fps}")]
    InvalidFps { episode_index: u32, fps: f64 },

    /// 时间戳倒退
    #[error("Timestamp went backwards at frame {frame_index}: {previous_us} -> {timestamp_us}")]
    NonMonotonic {
        frame_index: u32,
        previous_us: u64,
        timestamp_us: u64,
    },
}

// ============================================================================
// Schema
// ============================================================================

/// 单个字段的形状（各分量长度，缺失记为 0）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldShape {
    pub positions: usize,
    pub velocities: usize,
    pub torques: usize,
}

impl FieldShape {
    pub fn of(state: &JointState) -> Self {
        let (positions, velocities, torques) = state.shape();
        Self {
            positions,
            velocities,
            torques,
        }
    }
}

/// 数据集特征 schema：观测与动作的名称和形状
///
/// 由第一帧确定，一个会话内固定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub joint_names: Vec<String>,
    pub observation: FieldShape,
    pub action: FieldShape,
}

impl FeatureSchema {
    pub fn from_frame(joint_names: Vec<String>, observation: &JointState, action: &JointState) -> Self {
        Self {
            joint_names,
            observation: FieldShape::of(observation),
            action: FieldShape::of(action),
        }
    }

    /// 检查一帧是否符合 schema
    pub fn check(&self, observation: &JointState, action: &JointState) -> Result<(), EpisodeError> {
        for (field, expected, state) in [
            ("observation", self.observation, observation),
            ("action", self.action, action),
        ] {
            let actual = FieldShape::of(state);
            if actual != expected {
                return Err(EpisodeError::SchemaMismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// 形状是否相同（不比较关节名）
    pub fn same_shape(&self, other: &FeatureSchema) -> bool {
        self.observation == other.observation && self.action == other.action
    }
}

// ============================================================================
// 帧
// ============================================================================

/// 一个 tick 的样本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// 会话开始以来的单调时间（微秒）
    pub timestamp_us: u64,
    pub episode_index: u32,
    pub frame_index: u32,
    /// 归一化观测
    pub observation: JointState,
    /// 归一化动作（映射后的从臂命令）
    pub action: JointState,
    /// 摄像头名 → 外部图像引用（本仓库不采集图像）
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    /// 任务标签占位
    #[serde(default)]
    pub task_label: Option<String>,
}

impl Frame {
    pub fn new(timestamp_us: u64, observation: JointState, action: JointState) -> Self {
        Self {
            timestamp_us,
            episode_index: 0,
            frame_index: 0,
            observation,
            action,
            images: BTreeMap::new(),
            task_label: None,
        }
    }
}

// ============================================================================
// 片段
// ============================================================================

/// 片段：同一片段序号下按顺序排列的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub index: u32,
    pub task: String,
    /// 声明帧率
    pub fps: f64,
    pub frames: Vec<Frame>,
}

impl Episode {
    pub fn new(index: u32, task: impl Into<String>, fps: f64) -> Self {
        Self {
            index,
            task: task.into(),
            fps,
            frames: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 首尾帧时间跨度
    pub fn duration(&self) -> Option<Duration> {
        let first = self.frames.first()?.timestamp_us;
        let last = self.frames.last()?.timestamp_us;
        Some(Duration::from_micros(last.saturating_sub(first)))
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.timestamp_us).collect()
    }

    /// 帧间隔统计（少于两帧时为 `None`）
    pub fn interval_stats(&self) -> Option<IntervalStats> {
        IntervalStats::from_timestamps(&self.timestamps())
    }

    /// 检查帧率合法、帧属于本片段、序号从 0 连续、时间戳单调
    pub fn check_contiguous(&self) -> Result<(), EpisodeError> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(EpisodeError::InvalidFps {
                episode_index: self.index,
                fps: self.fps,
            });
        }
        let mut previous_us = None;
        for (i, frame) in self.frames.iter().enumerate() {
            if frame.episode_index != self.index {
                return Err(EpisodeError::WrongEpisode {
                    expected: self.index,
                    found: frame.episode_index,
                });
            }
            if frame.frame_index as usize != i {
                return Err(EpisodeError::NonContiguous {
                    episode_index: self.index,
                    expected: i as u32,
                    found: frame.frame_index,
                });
            }
            match previous_us {
                Some(previous_us) if frame.timestamp_us < previous_us => {
                    return Err(EpisodeError::NonMonotonic {
                        frame_index: frame.frame_index,
                        previous_us,
                        timestamp_us: frame.timestamp_us,
                    });
                },
                _ => {},
            }
            previous_us = Some(frame.timestamp_us);
        }
        Ok(())
    }

    /// 动作序列（回放用）
    pub fn actions(&self) -> impl Iterator<Item = &JointState> {
        self.frames.iter().map(|f| &f.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(episode: u32, index: u32, t: u64, joints: usize) -> Frame {
        let mut f = Frame::new(t, JointState::uniform(joints, 0.0), JointState::uniform(joints, 1.0));
        f.episode_index = episode;
        f.frame_index = index;
        f
    }

    #[test]
    fn test_schema_check() {
        let obs = JointState::uniform(7, 0.0);
        let schema = FeatureSchema::from_frame(vec![], &obs, &obs);
        assert!(schema.check(&obs, &obs).is_ok());

        let err = schema.check(&JointState::uniform(6, 0.0), &obs).unwrap_err();
        match err {
            EpisodeError::SchemaMismatch {
                field,
                expected,
                actual,
            } => {
                assert_eq!(field, "observation");
                assert_eq!(expected.positions, 7);
                assert_eq!(actual.positions, 6);
            },
            other => panic!("unexpected error: {:?}", other),
        }

        let mut with_velocity = obs.clone();
        with_velocity.velocities = Some(JointState::uniform(7, 0.0).positions);
        assert!(schema.check(&obs, &with_velocity).is_err());
    }

    #[test]
    fn test_contiguity() {
        let mut episode = Episode::new(3, "pick", 30.0);
        for i in 0..4 {
            episode.frames.push(frame(3, i, i as u64 * 33_333, 2));
        }
        assert!(episode.check_contiguous().is_ok());
        assert_eq!(episode.duration(), Some(Duration::from_micros(99_999)));

        episode.frames.remove(2);
        assert_eq!(
            episode.check_contiguous(),
            Err(EpisodeError::NonContiguous {
                episode_index: 3,
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn test_wrong_episode_and_time_order() {
        let mut episode = Episode::new(1, "t", 30.0);
        episode.frames.push(frame(2, 0, 0, 1));
        assert!(matches!(
            episode.check_contiguous(),
            Err(EpisodeError::WrongEpisode { expected: 1, found: 2 })
        ));

        let mut episode = Episode::new(1, "t", 30.0);
        episode.frames.push(frame(1, 0, 100, 1));
        episode.frames.push(frame(1, 1, 50, 1));
        assert!(matches!(episode.check_contiguous(), Err(EpisodeError::NonMonotonic { .. })));
    }

    #[test]
    fn test_invalid_fps_is_rejected() {
        for fps in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut episode = Episode::new(4, "t", fps);
            episode.frames.push(frame(4, 0, 0, 1));
            episode.frames.push(frame(4, 1, 33_333, 1));
            assert!(matches!(
                episode.check_contiguous(),
                Err(EpisodeError::InvalidFps { episode_index: 4, .. })
            ));
        }
    }

    #[test]
    fn test_empty_episode() {
        let episode = Episode::new(0, "t", 30.0);
        assert!(episode.is_empty());
        assert!(episode.duration().is_none());
        assert!(episode.interval_stats().is_none());
        assert!(episode.check_contiguous().is_ok());
    }
}
