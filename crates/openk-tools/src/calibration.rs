//! # 标定记录
//!
//! 每个关节一条记录：零点偏置、方向、原始量程与归一化模式。
//! 原始值 ↔ 归一化值是逐关节的仿射变换 `n = gain·raw + bias`，
//! 因此 `to_raw(to_normalized(x)) == x` 对所有有限值成立（仅有浮点误差）。
//!
//! 标定集合以 JSON 保存，每个机械臂一个文件：`<dir>/<arm_id>.json`。

use openk_protocol::{JointLayout, JointState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// 标定相关错误
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// 关节量程低于最小分辨率
    #[error("Joint '{joint}' span {span} is below the minimum of {min_span} raw units")]
    DegenerateSpan { joint: String, span: f64, min_span: f64 },

    /// 扫描期间没有读到该关节
    #[error("No reading recorded for joint '{joint}'")]
    NoReading { joint: String },

    /// 记录字段非法
    #[error("Invalid calibration for joint '{joint}': {reason}")]
    InvalidRecord { joint: String, reason: String },

    #[error("Calibration is missing joint '{joint}'")]
    MissingJoint { joint: String },

    #[error("Calibration lists joint '{joint}' more than once")]
    DuplicateJoint { joint: String },

    #[error("Calibration has {expected} joints but the state has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// 操作员中止
    #[error("Calibration aborted: {0}")]
    Aborted(String),

    #[error("Calibration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed calibration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// 单关节记录
// ============================================================================

/// 归一化模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NormMode {
    /// `[-100, 100]`
    #[default]
    #[serde(rename = "range_m100_100")]
    RangeM100_100,
    /// `[0, 100]`（夹爪）
    #[serde(rename = "range_0_100")]
    Range0_100,
    /// 去零点后的原始单位
    #[serde(rename = "none")]
    Identity,
}

/// 单关节标定记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub joint: String,
    /// 执行器 ID（仅用于核对）
    pub id: u16,
    /// 中位姿态下的原始读数
    pub offset: f64,
    /// 方向：`1` 或 `-1`
    pub sign: i8,
    /// 去零点后的量程下限
    pub range_min: f64,
    /// 去零点后的量程上限
    pub range_max: f64,
    #[serde(default)]
    pub norm_mode: NormMode,
}

impl CalibrationRecord {
    /// 校验记录，加载与构建时都会调用
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let invalid = |reason: String| CalibrationError::InvalidRecord {
            joint: self.joint.clone(),
            reason,
        };
        if self.joint.is_empty() {
            return Err(invalid("empty joint name".to_string()));
        }
        if self.sign != 1 && self.sign != -1 {
            return Err(invalid(format!("sign must be 1 or -1, got {}", self.sign)));
        }
        for (field, value) in [
            ("offset", self.offset),
            ("range_min", self.range_min),
            ("range_max", self.range_max),
        ] {
            if !value.is_finite() {
                return Err(invalid(format!("{} is not finite", field)));
            }
        }
        if self.range_min >= self.range_max {
            return Err(invalid(format!(
                "range_min {} must be below range_max {}",
                self.range_min, self.range_max
            )));
        }
        Ok(())
    }

    /// 原始量程跨度
    pub fn span(&self) -> f64 {
        self.range_max - self.range_min
    }

    /// 仿射系数 `(gain, bias)`，`n = gain·raw + bias`
    pub fn coefficients(&self) -> (f64, f64) {
        let span = self.span();
        let low = self.offset + self.range_min;
        let (gain, bias) = match self.norm_mode {
            NormMode::RangeM100_100 => (200.0 / span, -low * 200.0 / span - 100.0),
            NormMode::Range0_100 => (100.0 / span, -low * 100.0 / span),
            NormMode::Identity => (1.0, -self.offset),
        };
        match (self.sign, self.norm_mode) {
            (-1, NormMode::Range0_100) => (-gain, 100.0 - bias),
            (-1, _) => (-gain, -bias),
            _ => (gain, bias),
        }
    }

    pub fn to_normalized(&self, raw: f64) -> f64 {
        let (gain, bias) = self.coefficients();
        gain * raw + bias
    }

    pub fn to_raw(&self, normalized: f64) -> f64 {
        let (gain, bias) = self.coefficients();
        (normalized - bias) / gain
    }

    /// 归一化后的上下界，保证 `min <= max`
    pub fn bounds(&self) -> (f64, f64) {
        match self.norm_mode {
            NormMode::RangeM100_100 => (-100.0, 100.0),
            NormMode::Range0_100 => (0.0, 100.0),
            NormMode::Identity if self.sign < 0 => (-self.range_max, -self.range_min),
            NormMode::Identity => (self.range_min, self.range_max),
        }
    }
}

// ============================================================================
// 标定集合
// ============================================================================

/// 一个机械臂的完整标定
///
/// 记录顺序与关节布局一致；会话期间以 `Arc<CalibrationSet>` 只读共享。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    pub arm_id: String,
    pub records: Vec<CalibrationRecord>,
}

impl CalibrationSet {
    pub fn new(arm_id: impl Into<String>, records: Vec<CalibrationRecord>) -> Result<Self, CalibrationError> {
        let set = Self {
            arm_id: arm_id.into(),
            records,
        };
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        for (i, record) in self.records.iter().enumerate() {
            record.validate()?;
            if self.records[..i].iter().any(|r| r.joint == record.joint) {
                return Err(CalibrationError::DuplicateJoint {
                    joint: record.joint.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, joint: &str) -> Option<&CalibrationRecord> {
        self.records.iter().find(|r| r.joint == joint)
    }

    /// 按布局重新排序；缺少任一关节则失败
    ///
    /// 布局之外的多余记录被忽略。
    pub fn aligned_to(&self, layout: &JointLayout) -> Result<Self, CalibrationError> {
        let records = layout
            .names()
            .iter()
            .map(|name| {
                self.record(name)
                    .cloned()
                    .ok_or_else(|| CalibrationError::MissingJoint { joint: name.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            arm_id: self.arm_id.clone(),
            records,
        })
    }

    /// 各关节归一化上下界
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.records.iter().map(CalibrationRecord::bounds).collect()
    }

    fn check_len(&self, state: &JointState) -> Result<(), CalibrationError> {
        if state.len() != self.records.len() {
            return Err(CalibrationError::LengthMismatch {
                expected: self.records.len(),
                actual: state.len(),
            });
        }
        Ok(())
    }

    /// 原始值 → 归一化值（只转换位置，速度与力矩不保留）
    pub fn to_normalized(&self, raw: &JointState) -> Result<JointState, CalibrationError> {
        self.check_len(raw)?;
        Ok(JointState::from_positions(
            self.records
                .iter()
                .zip(&raw.positions)
                .map(|(record, &value)| record.to_normalized(value)),
        ))
    }

    /// 归一化值 → 原始值
    pub fn to_raw(&self, normalized: &JointState) -> Result<JointState, CalibrationError> {
        self.check_len(normalized)?;
        Ok(JointState::from_positions(
            self.records
                .iter()
                .zip(&normalized.positions)
                .map(|(record, &value)| record.to_raw(value)),
        ))
    }
}

// ============================================================================
// 持久化
// ============================================================================

/// 标定文件目录：`<dir>/<arm_id>.json`
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, arm_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", arm_id))
    }

    pub fn exists(&self, arm_id: &str) -> bool {
        self.path_for(arm_id).is_file()
    }

    /// 加载并校验；文件缺失、格式错误或记录非法都直接失败
    pub fn load(&self, arm_id: &str) -> Result<CalibrationSet, CalibrationError> {
        let path = self.path_for(arm_id);
        let content = fs::read_to_string(&path).map_err(|source| CalibrationError::Io {
            path: path.clone(),
            source,
        })?;
        let set: CalibrationSet =
            serde_json::from_str(&content).map_err(|source| CalibrationError::Parse {
                path: path.clone(),
                source,
            })?;
        set.validate()?;
        debug!("Loaded calibration for '{}' from {}", arm_id, path.display());
        Ok(set)
    }

    /// 加载并按布局对齐
    pub fn load_for(&self, arm_id: &str, layout: &JointLayout) -> Result<CalibrationSet, CalibrationError> {
        self.load(arm_id)?.aligned_to(layout)
    }

    /// 原子写入（临时文件 + rename）
    pub fn save(&self, set: &CalibrationSet) -> Result<PathBuf, CalibrationError> {
        set.validate()?;
        let path = self.path_for(&set.arm_id);
        let io_err = |source| CalibrationError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(set).map_err(|source| CalibrationError::Parse {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;

        info!("Calibration for '{}' saved to {}", set.arm_id, path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(joint: &str, sign: i8, mode: NormMode) -> CalibrationRecord {
        CalibrationRecord {
            joint: joint.to_string(),
            id: 1,
            offset: 2048.0,
            sign,
            range_min: -1000.0,
            range_max: 1200.0,
            norm_mode: mode,
        }
    }

    #[test]
    fn test_m100_maps_range_ends() {
        let r = record("shoulder_pan", 1, NormMode::RangeM100_100);
        assert!((r.to_normalized(2048.0 - 1000.0) + 100.0).abs() < 1e-9);
        assert!((r.to_normalized(2048.0 + 1200.0) - 100.0).abs() < 1e-9);

        let mirrored = record("shoulder_pan", -1, NormMode::RangeM100_100);
        assert!((mirrored.to_normalized(2048.0 - 1000.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_0_100_sign_flip() {
        let r = record("grip", 1, NormMode::Range0_100);
        assert!(r.to_normalized(1048.0).abs() < 1e-9);
        let flipped = record("grip", -1, NormMode::Range0_100);
        assert!((flipped.to_normalized(1048.0) - 100.0).abs() < 1e-9);
        assert!((flipped.to_normalized(3248.0)).abs() < 1e-9);
        assert_eq!(flipped.bounds(), (0.0, 100.0));
    }

    #[test]
    fn test_identity_bounds_follow_sign() {
        let r = record("wrist_roll", 1, NormMode::Identity);
        assert_eq!(r.bounds(), (-1000.0, 1200.0));
        assert_eq!(r.to_normalized(2048.0), 0.0);

        let r = record("wrist_roll", -1, NormMode::Identity);
        assert_eq!(r.bounds(), (-1200.0, 1000.0));
        assert_eq!(r.to_normalized(2148.0), -100.0);
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        let mut r = record("elbow_flex", 1, NormMode::RangeM100_100);
        r.range_max = r.range_min;
        assert!(matches!(r.validate(), Err(CalibrationError::InvalidRecord { .. })));

        let mut r = record("elbow_flex", 2, NormMode::RangeM100_100);
        assert!(r.validate().is_err());
        r.sign = 1;
        r.offset = f64::NAN;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_set_rejects_duplicates_and_aligns() {
        let err = CalibrationSet::new(
            "leader",
            vec![
                record("a", 1, NormMode::RangeM100_100),
                record("a", 1, NormMode::RangeM100_100),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CalibrationError::DuplicateJoint { .. }));

        let set = CalibrationSet::new(
            "leader",
            vec![record("b", 1, NormMode::Range0_100), record("a", 1, NormMode::RangeM100_100)],
        )
        .unwrap();
        let layout = JointLayout::new(["a", "b"]).unwrap();
        let aligned = set.aligned_to(&layout).unwrap();
        assert_eq!(aligned.records[0].joint, "a");
        assert_eq!(aligned.bounds(), vec![(-100.0, 100.0), (0.0, 100.0)]);

        let layout = JointLayout::new(["a", "c"]).unwrap();
        assert!(matches!(
            set.aligned_to(&layout),
            Err(CalibrationError::MissingJoint { joint }) if joint == "c"
        ));
    }

    #[test]
    fn test_state_length_checked() {
        let set = CalibrationSet::new("leader", vec![record("a", 1, NormMode::RangeM100_100)]).unwrap();
        let err = set.to_normalized(&JointState::uniform(2, 0.0)).unwrap_err();
        assert!(matches!(err, CalibrationError::LengthMismatch { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_store_roundtrip_and_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibration"));
        let set = CalibrationSet::new(
            "follower",
            vec![record("a", -1, NormMode::RangeM100_100), record("b", 1, NormMode::Range0_100)],
        )
        .unwrap();

        let path = store.save(&set).unwrap();
        assert_eq!(path, dir.path().join("calibration").join("follower.json"));
        assert_eq!(store.load("follower").unwrap(), set);

        assert!(matches!(store.load("missing"), Err(CalibrationError::Io { .. })));

        fs::write(store.path_for("broken"), "{\"arm_id\": \"broken\"}").unwrap();
        assert!(matches!(store.load("broken"), Err(CalibrationError::Parse { .. })));

        let mut bad = set.clone();
        bad.arm_id = "bad".to_string();
        bad.records[0].sign = 0;
        let json = serde_json::to_string(&bad).unwrap();
        fs::write(store.path_for("bad"), json).unwrap();
        assert!(matches!(store.load("bad"), Err(CalibrationError::InvalidRecord { .. })));
    }

    #[test]
    fn test_norm_mode_serde_names() {
        assert_eq!(serde_json::to_string(&NormMode::Range0_100).unwrap(), "\"range_0_100\"");
        assert_eq!(serde_json::to_string(&NormMode::Identity).unwrap(), "\"none\"");
    }

    fn mode_strategy() -> impl Strategy<Value = NormMode> {
        prop_oneof![
            Just(NormMode::RangeM100_100),
            Just(NormMode::Range0_100),
            Just(NormMode::Identity),
        ]
    }

    proptest! {
        #[test]
        fn prop_raw_roundtrip(
            offset in -5000.0f64..5000.0,
            low in -3000.0f64..0.0,
            span in 1.0f64..6000.0,
            sign in prop_oneof![Just(1i8), Just(-1i8)],
            mode in mode_strategy(),
            raw in -10000.0f64..10000.0,
        ) {
            let r = CalibrationRecord {
                joint: "j".to_string(),
                id: 1,
                offset,
                sign,
                range_min: low,
                range_max: low + span,
                norm_mode: mode,
            };
            prop_assert!(r.validate().is_ok());
            let back = r.to_raw(r.to_normalized(raw));
            prop_assert!((back - raw).abs() <= 1e-6 * (1.0 + raw.abs()));
            let (min, max) = r.bounds();
            prop_assert!(min <= max);
        }
    }
}
