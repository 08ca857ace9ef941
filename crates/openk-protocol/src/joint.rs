//! 关节状态与关节布局
//!
//! `JointState` 是主臂与从臂共享的关节向量，顺序由 `JointLayout` 固定，
//! 一个会话内长度与顺序不变。

use crate::ProtocolError;
use smallvec::SmallVec;

/// 单个关节向量的存储（≤ 8 个关节时无堆分配）
pub type JointValues = SmallVec<[f64; 8]>;

/// 关节状态：按布局顺序排列的位置，可选速度与力矩
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointState {
    pub positions: JointValues,
    pub velocities: Option<JointValues>,
    pub torques: Option<JointValues>,
}

impl JointState {
    /// 仅包含位置的关节状态
    pub fn from_positions(positions: impl IntoIterator<Item = f64>) -> Self {
        Self {
            positions: positions.into_iter().collect(),
            velocities: None,
            torques: None,
        }
    }

    /// 所有关节取同一值
    pub fn uniform(len: usize, value: f64) -> Self {
        Self::from_positions(std::iter::repeat_n(value, len))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// 检查长度是否与期望一致
    pub fn ensure_len(&self, expected: usize) -> Result<(), ProtocolError> {
        if self.positions.len() != expected {
            return Err(ProtocolError::InvalidLength {
                expected,
                actual: self.positions.len(),
            });
        }
        for (field, values) in [("velocities", &self.velocities), ("torques", &self.torques)] {
            match values {
                Some(values) if values.len() != expected => {
                    return Err(ProtocolError::InvalidValue {
                        field,
                        value: values.len() as u32,
                    });
                },
                _ => {},
            }
        }
        Ok(())
    }

    /// 字段形状：`(位置数, 速度数, 力矩数)`，缺失字段记为 0
    pub fn shape(&self) -> (usize, usize, usize) {
        (
            self.positions.len(),
            self.velocities.as_ref().map_or(0, |v| v.len()),
            self.torques.as_ref().map_or(0, |v| v.len()),
        )
    }
}

/// 关节名称 → 下标的稳定映射
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointLayout {
    names: Vec<String>,
}

impl JointLayout {
    /// 创建布局
    ///
    /// # 错误
    /// 名称为空或重复时返回 `ProtocolError::InvalidValue`。
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Result<Self, ProtocolError> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(ProtocolError::InvalidValue {
                field: "joint_layout",
                value: 0,
            });
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(ProtocolError::InvalidValue {
                    field: "duplicate_joint_name",
                    value: i as u32,
                });
            }
        }
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_rejects_duplicates() {
        let err = JointLayout::new(["a", "b", "a"]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidValue {
                field: "duplicate_joint_name",
                value: 2
            }
        ));
    }

    #[test]
    fn test_layout_index_lookup() {
        let layout = JointLayout::new(["shoulder_pan", "elbow_flex", "grip"]).unwrap();
        assert_eq!(layout.index_of("elbow_flex"), Some(1));
        assert_eq!(layout.index_of("missing"), None);
        assert_eq!(layout.name(2), Some("grip"));
    }

    #[test]
    fn test_ensure_len_checks_optional_fields() {
        let mut state = JointState::uniform(3, 0.0);
        assert!(state.ensure_len(3).is_ok());
        assert!(state.ensure_len(4).is_err());

        state.velocities = Some(JointValues::from_slice(&[0.0, 1.0]));
        assert!(state.ensure_len(3).is_err());
    }

    #[test]
    fn test_shape() {
        let mut state = JointState::uniform(5, 1.0);
        assert_eq!(state.shape(), (5, 0, 0));
        state.torques = Some(JointValues::from_slice(&[0.0; 5]));
        assert_eq!(state.shape(), (5, 0, 5));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_joint_state_json() {
        let state = JointState::from_positions([1.5, -2.0]);
        let json = serde_json::to_string(&state).unwrap();
        let back: JointState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
