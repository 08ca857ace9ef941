//! 关节映射：主臂归一化向量 → 从臂归一化命令
//!
//! 默认按下标一一对应；可选的重命名表在会话开始时校验为双射。
//! 每个输出都截断到从臂标定的上下界（截断而非拒绝，并计数），
//! 可选的单步限幅让命令每个 tick 最多移动 `max_step`。

use openk_protocol::{JointLayout, JointState, JointValues};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// 映射错误
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MapperError {
    #[error("Expected {expected} joints, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Remap table is not a bijection: {0}")]
    NotBijection(String),

    #[error("Bounds for joint {index} are invalid: [{min}, {max}]")]
    InvalidBounds { index: usize, min: f64, max: f64 },

    #[error("max_step must be positive, got {0}")]
    InvalidStep(f64),

    #[error("Non-finite value for leader joint {index}")]
    NonFinite { index: usize },
}

/// 关节映射器
#[derive(Debug, Clone)]
pub struct JointMapper {
    /// 从臂第 i 个关节取主臂第 `sources[i]` 个关节
    sources: Vec<usize>,
    bounds: Vec<(f64, f64)>,
    max_step: Option<f64>,
    previous: Option<JointValues>,
    clamp_counts: Vec<u64>,
}

impl JointMapper {
    /// 按下标一一对应
    pub fn identity(bounds: Vec<(f64, f64)>) -> Result<Self, MapperError> {
        let sources = (0..bounds.len()).collect();
        Self::with_sources(sources, bounds)
    }

    /// 按名称映射
    ///
    /// `remap` 为空时按下标对应；否则每个主臂关节映射到 `remap` 中的名字，
    /// 未列出的映射到同名关节，结果必须覆盖每个从臂关节恰好一次。
    pub fn from_layouts(
        leader: &JointLayout,
        follower: &JointLayout,
        remap: &BTreeMap<String, String>,
        bounds: Vec<(f64, f64)>,
    ) -> Result<Self, MapperError> {
        if leader.len() != follower.len() {
            return Err(MapperError::LengthMismatch {
                expected: follower.len(),
                actual: leader.len(),
            });
        }
        if remap.is_empty() {
            return Self::identity(bounds);
        }

        let mut sources: Vec<Option<usize>> = vec![None; follower.len()];
        for (leader_index, name) in leader.names().iter().enumerate() {
            let target = remap.get(name).unwrap_or(name);
            let follower_index = follower.index_of(target).ok_or_else(|| {
                MapperError::NotBijection(format!("'{}' maps to unknown follower joint '{}'", name, target))
            })?;
            if let Some(other) = sources[follower_index] {
                return Err(MapperError::NotBijection(format!(
                    "follower joint '{}' is targeted by both '{}' and '{}'",
                    target,
                    leader.name(other).unwrap_or("?"),
                    name
                )));
            }
            sources[follower_index] = Some(leader_index);
        }
        // 长度相等且无重复目标，因此每个位置都已填充
        let sources = sources.into_iter().flatten().collect();
        debug!("Joint remap: {:?}", sources);
        Self::with_sources(sources, bounds)
    }

    fn with_sources(sources: Vec<usize>, bounds: Vec<(f64, f64)>) -> Result<Self, MapperError> {
        if sources.len() != bounds.len() {
            return Err(MapperError::LengthMismatch {
                expected: bounds.len(),
                actual: sources.len(),
            });
        }
        for (index, &(min, max)) in bounds.iter().enumerate() {
            if !(min.is_finite() && max.is_finite() && min <= max) {
                return Err(MapperError::InvalidBounds { index, min, max });
            }
        }
        Ok(Self {
            clamp_counts: vec![0; bounds.len()],
            sources,
            bounds,
            max_step: None,
            previous: None,
        })
    }

    /// 设置单步限幅
    pub fn with_max_step(mut self, max_step: Option<f64>) -> Result<Self, MapperError> {
        if let Some(step) = max_step {
            if !(step.is_finite() && step > 0.0) {
                return Err(MapperError::InvalidStep(step));
            }
        }
        self.max_step = max_step;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    /// 以从臂当前位置作为单步限幅的起点
    pub fn seed(&mut self, follower_normalized: &JointState) {
        let seeded = follower_normalized
            .positions
            .iter()
            .zip(&self.bounds)
            .map(|(&v, &(min, max))| v.clamp(min, max))
            .collect();
        self.previous = Some(seeded);
    }

    /// 清除上一条命令
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// 映射一帧
    pub fn map(&mut self, leader: &JointState) -> Result<JointState, MapperError> {
        if leader.len() != self.sources.len() {
            return Err(MapperError::LengthMismatch {
                expected: self.sources.len(),
                actual: leader.len(),
            });
        }
        if let Some(index) = leader.positions.iter().position(|v| !v.is_finite()) {
            return Err(MapperError::NonFinite { index });
        }

        let mut out = JointValues::with_capacity(self.sources.len());
        for (i, &source) in self.sources.iter().enumerate() {
            let (min, max) = self.bounds[i];
            let value = leader.positions[source];
            let mut target = value.clamp(min, max);
            let mut clamped = target != value;

            if let (Some(step), Some(previous)) = (self.max_step, &self.previous) {
                let prev = previous[i];
                let delta = target - prev;
                if delta.abs() > step {
                    target = prev + step.copysign(delta);
                    clamped = true;
                }
            }

            if clamped {
                self.clamp_counts[i] += 1;
                warn!(
                    "Joint {} command {:.3} limited to {:.3} (bounds [{:.3}, {:.3}])",
                    i, value, target, min, max
                );
            }
            out.push(target);
        }

        self.previous = Some(out.clone());
        Ok(JointState {
            positions: out,
            velocities: None,
            torques: None,
        })
    }

    /// 每个从臂关节的截断次数
    pub fn clamp_counts(&self) -> &[u64] {
        &self.clamp_counts
    }

    pub fn total_clamps(&self) -> u64 {
        self.clamp_counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layout(names: &[&str]) -> JointLayout {
        JointLayout::new(names.iter().copied()).unwrap()
    }

    #[test]
    fn test_identity_clamps_to_exact_bound() {
        let mut mapper = JointMapper::identity(vec![(-100.0, 100.0), (0.0, 100.0)]).unwrap();
        let out = mapper.map(&JointState::from_positions([150.0, -3.0])).unwrap();
        assert_eq!(out.positions.as_slice(), &[100.0, 0.0]);
        assert_eq!(mapper.clamp_counts(), &[1, 1]);

        let out = mapper.map(&JointState::from_positions([12.5, 40.0])).unwrap();
        assert_eq!(out.positions.as_slice(), &[12.5, 40.0]);
        assert_eq!(mapper.total_clamps(), 2);
    }

    #[test]
    fn test_remap_by_name() {
        let leader = layout(&["a", "b", "c"]);
        let follower = layout(&["x", "b", "y"]);
        let remap: BTreeMap<String, String> = [("a", "y"), ("c", "x")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut mapper = JointMapper::from_layouts(&leader, &follower, &remap, vec![(-100.0, 100.0); 3]).unwrap();

        let out = mapper.map(&JointState::from_positions([1.0, 2.0, 3.0])).unwrap();
        assert_eq!(out.positions.as_slice(), &[3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_remap_must_be_bijection() {
        let leader = layout(&["a", "b"]);
        let follower = layout(&["a", "b"]);
        let remap: BTreeMap<String, String> = [("a".to_string(), "b".to_string())].into_iter().collect();
        let err = JointMapper::from_layouts(&leader, &follower, &remap, vec![(0.0, 1.0); 2]).unwrap_err();
        assert!(matches!(err, MapperError::NotBijection(_)));

        let remap: BTreeMap<String, String> = [("a".to_string(), "zz".to_string())].into_iter().collect();
        assert!(JointMapper::from_layouts(&leader, &follower, &remap, vec![(0.0, 1.0); 2]).is_err());
    }

    #[test]
    fn test_max_step_limits_motion() {
        let mut mapper = JointMapper::identity(vec![(-100.0, 100.0)])
            .unwrap()
            .with_max_step(Some(5.0))
            .unwrap();
        mapper.seed(&JointState::from_positions([0.0]));

        let out = mapper.map(&JointState::from_positions([50.0])).unwrap();
        assert_eq!(out.positions[0], 5.0);
        let out = mapper.map(&JointState::from_positions([-50.0])).unwrap();
        assert_eq!(out.positions[0], 0.0);
        let out = mapper.map(&JointState::from_positions([3.0])).unwrap();
        assert_eq!(out.positions[0], 3.0);
        assert_eq!(mapper.total_clamps(), 2);

        assert!(JointMapper::identity(vec![]).unwrap().with_max_step(Some(0.0)).is_err());
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut mapper = JointMapper::identity(vec![(0.0, 1.0)]).unwrap();
        assert!(matches!(
            mapper.map(&JointState::from_positions([f64::NAN])),
            Err(MapperError::NonFinite { index: 0 })
        ));
        assert!(matches!(
            mapper.map(&JointState::from_positions([0.0, 0.0])),
            Err(MapperError::LengthMismatch { expected: 1, actual: 2 })
        ));
        assert!(matches!(
            JointMapper::identity(vec![(1.0, 0.0)]),
            Err(MapperError::InvalidBounds { index: 0, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_output_within_bounds(
            values in proptest::collection::vec(-1e6f64..1e6, 4),
            lo in -200.0f64..0.0,
            width in 0.0f64..300.0,
        ) {
            let mut mapper = JointMapper::identity(vec![(lo, lo + width); 4]).unwrap();
            let out = mapper.map(&JointState::from_positions(values.iter().copied())).unwrap();
            for (v, o) in values.iter().zip(&out.positions) {
                prop_assert!(*o >= lo && *o <= lo + width);
                if *v < lo { prop_assert_eq!(*o, lo); }
                if *v > lo + width { prop_assert_eq!(*o, lo + width); }
            }
        }
    }
}
