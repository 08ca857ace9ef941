//! 场景测试的公共辅助函数
#![allow(dead_code)]

use openk_bus::mock::{MockBus, MockBusHandle};
use openk_client::{
    ControlLoop, EpisodeRecorder, JointMapper, LoopConfig, ManualClock, RecorderEvent, RecorderSink, RecorderWorker,
};
use openk_tools::dataset::Dataset;
use openk_tools::{CalibrationRecord, CalibrationSet, FpsPolicy, NormMode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const JOINTS: usize = 3;
pub const CENTER: f64 = 2048.0;

pub fn joint_names() -> Vec<String> {
    (0..JOINTS).map(|i| format!("joint_{}", i + 1)).collect()
}

pub fn ids() -> Vec<u16> {
    (1..=JOINTS as u16).collect()
}

/// 中位 2048、行程 ±1000 的标定
pub fn calibration(arm: &str) -> Arc<CalibrationSet> {
    let records = joint_names()
        .into_iter()
        .zip(ids())
        .map(|(joint, id)| CalibrationRecord {
            joint,
            id,
            offset: CENTER,
            sign: 1,
            range_min: -1000.0,
            range_max: 1000.0,
            norm_mode: NormMode::RangeM100_100,
        })
        .collect();
    Arc::new(CalibrationSet::new(arm, records).unwrap())
}

pub struct Rig {
    pub control: ControlLoop<MockBus, MockBus, ManualClock>,
    pub leader: MockBusHandle,
    pub follower: MockBusHandle,
    pub clock: ManualClock,
}

/// 两条模拟总线、手动时钟、两臂都在中位
pub fn rig(config: LoopConfig) -> Rig {
    let (leader_bus, leader) = MockBus::new(&ids());
    let (follower_bus, follower) = MockBus::new(&ids());
    leader.set_positions(&[CENTER; JOINTS]);
    follower.set_positions(&[CENTER; JOINTS]);

    let follower_cal = calibration("follower");
    let mapper = JointMapper::identity(follower_cal.bounds()).unwrap();
    let clock = ManualClock::new();
    let control = ControlLoop::with_clock(
        leader_bus,
        follower_bus,
        calibration("leader"),
        follower_cal,
        mapper,
        config,
        clock.clone(),
    )
    .unwrap();
    Rig {
        control,
        leader,
        follower,
        clock,
    }
}

pub fn spawn_recorder(dataset: Dataset) -> (RecorderWorker, RecorderSink) {
    let recorder = EpisodeRecorder::new(dataset, joint_names(), FpsPolicy::default());
    RecorderWorker::spawn(recorder, 256, 1024).unwrap()
}

pub fn new_dataset(root: &Path, fps: f64) -> Dataset {
    Dataset::create(root, fps).unwrap()
}

/// 等待封存结果（跳过 Started 事件）
pub fn wait_for_outcome(worker: &RecorderWorker) -> RecorderEvent {
    loop {
        match worker.next_event(Duration::from_secs(10)) {
            Some(RecorderEvent::Started { .. }) => continue,
            Some(event) => return event,
            None => panic!("recorder produced no outcome"),
        }
    }
}
