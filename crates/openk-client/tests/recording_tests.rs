//! 录制场景测试：控制循环 → 存储线程 → 数据集

mod common;

use common::{CENTER, JOINTS, joint_names, new_dataset, rig, spawn_recorder, wait_for_outcome};
use openk_client::{
    EpisodeRecorder, LoopConfig, RecorderError, RecorderEvent, RecorderWorker, RejectReason, RunLimit, StopReason,
};
use openk_protocol::JointState;
use openk_tools::dataset::Dataset;
use openk_tools::{FpsPolicy, FpsViolation, Frame};
use std::time::Duration;

#[test]
fn test_constant_pose_for_one_second_yields_thirty_frames() {
    let dir = tempfile::tempdir().unwrap();
    let (worker, mut sink) = spawn_recorder(new_dataset(dir.path(), 30.0));
    let mut rig = rig(LoopConfig::default());

    sink.start_episode("hold", 30.0).unwrap();
    rig.control.attach_recorder(sink);
    rig.control.connect().unwrap();
    let report = rig.control.run(RunLimit::duration(Duration::from_secs(1))).unwrap();
    assert_eq!(report.ticks, 30);
    assert_eq!(report.overruns, 0);

    let mut sink = rig.control.detach_recorder().unwrap();
    assert!(!sink.is_degraded());
    sink.seal().unwrap();

    match wait_for_outcome(&worker) {
        RecorderEvent::Sealed(sealed) => {
            assert_eq!(sealed.index, 0);
            assert_eq!(sealed.frames, 30);
            assert!((sealed.stats.measured_fps() - 30.0).abs() < 0.1);
        },
        other => panic!("unexpected event: {:?}", other),
    }

    let recorder = worker.shutdown().unwrap();
    let episode = recorder.dataset().load_episode(0).unwrap();
    assert_eq!(episode.len(), 30);
    for (i, frame) in episode.frames.iter().enumerate() {
        assert_eq!(frame.frame_index, i as u32);
        assert_eq!(frame.action, episode.frames[0].action);
        assert_eq!(frame.action.len(), JOINTS);
    }
    // 中位对应归一化 0
    assert!(episode.frames[0].action.positions.iter().all(|v| v.abs() < 1e-9));
    assert_eq!(recorder.dataset().schema().unwrap().joint_names, joint_names());
}

#[test]
fn test_cancel_mid_episode_seals_recorded_frames() {
    const TICKS: u32 = 12;
    let dir = tempfile::tempdir().unwrap();
    let (worker, mut sink) = spawn_recorder(new_dataset(dir.path(), 30.0));
    let mut rig = rig(LoopConfig::default());

    sink.start_episode("interrupted", 30.0).unwrap();
    rig.control.attach_recorder(sink);
    rig.control.connect().unwrap();

    // 第 TICKS 次读主臂时触发取消，该 tick 仍完整执行
    let cancel = rig.control.cancel_token();
    let mut reads = 0u32;
    rig.leader.set_read_hook(move || {
        reads += 1;
        if reads == TICKS {
            cancel.cancel();
        }
    });

    let report = rig.control.run(RunLimit::unbounded()).unwrap();
    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(report.ticks, TICKS as u64);

    let mut sink = rig.control.detach_recorder().unwrap();
    sink.seal().unwrap();
    match wait_for_outcome(&worker) {
        RecorderEvent::Sealed(sealed) => {
            assert_eq!(sealed.index, 0);
            assert_eq!(sealed.frames, TICKS as usize);
        },
        other => panic!("unexpected event: {:?}", other),
    }

    let recorder = worker.shutdown().unwrap();
    let episode = recorder.dataset().load_episode(0).unwrap();
    assert_eq!(episode.len(), TICKS as usize);
    episode.check_contiguous().unwrap();
    assert_eq!(episode.frames.last().map(|f| f.frame_index), Some(TICKS - 1));
}

#[test]
fn test_gap_over_one_and_a_half_periods_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (worker, mut sink) = spawn_recorder(new_dataset(dir.path(), 30.0));
    let mut rig = rig(LoopConfig::default());

    // 第 11 个 tick 卡顿 80 ms
    let clock = rig.clock.clone();
    let mut reads = 0;
    rig.leader.set_read_hook(move || {
        reads += 1;
        if reads == 11 {
            clock.advance(Duration::from_millis(80));
        }
    });

    sink.start_episode("stall", 30.0).unwrap();
    rig.control.attach_recorder(sink);
    rig.control.connect().unwrap();
    let report = rig.control.run(RunLimit::ticks(30)).unwrap();
    assert_eq!(report.overruns, 1);

    let mut sink = rig.control.detach_recorder().unwrap();
    sink.seal().unwrap();
    match wait_for_outcome(&worker) {
        RecorderEvent::Rejected { index, reason } => {
            assert_eq!(index, 0);
            assert!(matches!(reason, RejectReason::Fps(FpsViolation::GapTooLarge { .. })));
        },
        other => panic!("unexpected event: {:?}", other),
    }

    // 被拒绝的序号由下一个片段复用
    sink.start_episode("retry", 30.0).unwrap();
    assert_eq!(
        worker.next_event(Duration::from_secs(10)),
        Some(RecorderEvent::Started { index: 0 })
    );
    sink.discard().unwrap();

    let recorder = worker.shutdown().unwrap();
    assert!(recorder.dataset().is_empty());
}

#[test]
fn test_resume_continues_numbering() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (worker, mut sink) = spawn_recorder(new_dataset(dir.path(), 30.0));
        for _ in 0..2 {
            let mut rig = rig(LoopConfig::default());
            sink.start_episode("pick", 30.0).unwrap();
            rig.control.attach_recorder(sink);
            rig.control.connect().unwrap();
            rig.control.run(RunLimit::ticks(10)).unwrap();
            sink = rig.control.detach_recorder().unwrap();
            sink.seal().unwrap();
            assert!(matches!(wait_for_outcome(&worker), RecorderEvent::Sealed(_)));
        }
        worker.shutdown().unwrap();
    }

    let dataset = Dataset::open(dir.path()).unwrap();
    assert_eq!(dataset.len(), 2);
    assert!(matches!(
        EpisodeRecorder::resume(dataset, 0, joint_names(), FpsPolicy::default()),
        Err(RecorderError::Resume(_))
    ));

    let dataset = Dataset::open(dir.path()).unwrap();
    let recorder = EpisodeRecorder::resume(dataset, 2, joint_names(), FpsPolicy::default()).unwrap();
    let (worker, mut sink) = RecorderWorker::spawn(recorder, 16, 16).unwrap();
    let mut rig = rig(LoopConfig::default());
    rig.leader.set_positions(&[CENTER + 100.0; JOINTS]);
    sink.start_episode("place", 30.0).unwrap();
    rig.control.attach_recorder(sink);
    rig.control.connect().unwrap();
    rig.control.run(RunLimit::ticks(10)).unwrap();
    let mut sink = rig.control.detach_recorder().unwrap();
    sink.seal().unwrap();

    match wait_for_outcome(&worker) {
        RecorderEvent::Sealed(sealed) => assert_eq!(sealed.index, 2),
        other => panic!("unexpected event: {:?}", other),
    }
    let recorder = worker.shutdown().unwrap();
    assert_eq!(recorder.dataset().len(), 3);
    assert_eq!(recorder.dataset().meta().total_frames(), 30);
}

#[test]
fn test_schema_mismatch_keeps_prior_frames() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = new_dataset(dir.path(), 30.0);
    let mut recorder = EpisodeRecorder::new(dataset, joint_names(), FpsPolicy::default());
    let handle = recorder.start_episode("pick", 30.0).unwrap();

    for i in 0..3u64 {
        let state = JointState::uniform(JOINTS, 0.0);
        recorder.append(Frame::new(i * 33_333, state.clone(), state)).unwrap();
    }

    let wide = JointState::uniform(JOINTS + 1, 0.0);
    let narrow = JointState::uniform(JOINTS, 0.0);
    assert!(matches!(
        recorder.append(Frame::new(99_999, wide, narrow)),
        Err(RecorderError::SchemaMismatch(_))
    ));
    assert_eq!(recorder.open_frames().unwrap().len(), 3);

    let sealed = recorder.seal_episode(handle).unwrap();
    assert_eq!(sealed.frames, 3);
}
