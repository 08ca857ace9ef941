//! 控制循环场景测试
//!
//! 模拟总线 + 手动时钟，验证故障停机、状态机和观测来源。

mod common;

use common::{CENTER, JOINTS, calibration, ids, rig};
use openk_bus::BusError;
use openk_bus::mock::MockBus;
use openk_client::{
    BusRole, ControlError, ControlLoop, JointMapper, LoopConfig, LoopState, ManualClock, RunLimit, StopReason,
};
use openk_tools::ObservationSource;
use std::time::Duration;

#[test]
fn test_three_consecutive_write_timeouts_stop_the_loop() {
    let mut rig = rig(LoopConfig::default());
    let failing = rig.follower.clone();
    let mut reads = 0;
    rig.leader.set_read_hook(move || {
        reads += 1;
        if reads == 6 {
            failing.set_writes_failing(true);
        }
    });

    rig.control.connect().unwrap();
    let err = rig.control.run(RunLimit::ticks(100)).unwrap_err();

    match &err {
        ControlError::ConnectionFault {
            role,
            tick,
            count,
            last_error,
        } => {
            assert_eq!(*role, BusRole::Follower);
            assert_eq!(*tick, 7);
            assert_eq!(*count, 3);
            assert!(matches!(**last_error, BusError::Timeout { .. }));
        },
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_fatal());
    assert_eq!(rig.control.state(), LoopState::Idle);

    // 5 个成功 tick，之后 3 个 tick 各尝试两次
    assert_eq!(rig.follower.write_count(), 5);
    assert_eq!(rig.follower.write_calls(), 11);

    // 停止后不再写
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(rig.follower.write_calls(), 11);

    let status = rig.control.status().load();
    assert_eq!(status.state, LoopState::Idle);
    assert!(status.last_error.is_some());
}

#[test]
fn test_leader_read_timeouts_stop_the_loop() {
    let mut rig = rig(LoopConfig::default());
    rig.control.connect().unwrap();
    rig.leader.set_reads_failing(true);

    let err = rig.control.run(RunLimit::ticks(100)).unwrap_err();
    assert!(matches!(
        err,
        ControlError::ConnectionFault {
            role: BusRole::Leader,
            tick: 2,
            count: 3,
            ..
        }
    ));
    assert_eq!(rig.follower.write_calls(), 0);
}

#[test]
fn test_isolated_failures_do_not_accumulate() {
    let mut rig = rig(LoopConfig::default());
    rig.control.connect().unwrap();

    // 两次失败 tick 之间有成功 tick，计数被清零
    let failing = rig.leader.clone();
    let mut reads = 0;
    rig.leader.set_read_hook(move || {
        reads += 1;
        if reads % 5 == 0 {
            failing.fail_next_reads(2);
        }
    });

    let report = rig.control.run(RunLimit::ticks(20)).unwrap();
    assert_eq!(report.ticks, 20);
    assert!(report.skipped_ticks > 0);
    assert_eq!(report.skipped_ticks, report.leader_failures);
    assert_eq!(report.stop_reason, StopReason::LimitReached);
}

#[test]
fn test_missing_actuator_blocks_connect() {
    let mut rig = rig(LoopConfig::default());
    rig.leader.remove_actuator(2);

    let err = rig.control.connect().unwrap_err();
    assert!(matches!(
        err,
        ControlError::MissingActuators {
            role: BusRole::Leader,
            ref missing,
        } if missing == &vec![2]
    ));
    assert_eq!(rig.control.state(), LoopState::Idle);
    assert!(!rig.follower.torque_enabled());
}

#[test]
fn test_invalid_rate_is_rejected_at_construction() {
    for fps in [0.0, -30.0, f64::NAN, f64::INFINITY] {
        let (leader, _) = MockBus::new(&ids());
        let (follower, _) = MockBus::new(&ids());
        let follower_cal = calibration("follower");
        let mapper = JointMapper::identity(follower_cal.bounds()).unwrap();
        let result = ControlLoop::with_clock(
            leader,
            follower,
            calibration("leader"),
            follower_cal,
            mapper,
            LoopConfig {
                fps,
                ..LoopConfig::default()
            },
            ManualClock::new(),
        );
        assert!(matches!(result, Err(ControlError::InvalidFps { .. })));
    }
}

#[test]
fn test_out_of_range_leader_is_clamped() {
    let mut rig = rig(LoopConfig::default());
    rig.control.connect().unwrap();
    rig.leader.set_positions(&[CENTER + 5000.0, CENTER, CENTER - 5000.0]);

    let report = rig.control.run(RunLimit::ticks(3)).unwrap();
    assert_eq!(report.clamp_events, 6);

    let written = rig.follower.last_write().unwrap();
    assert!((written.positions[0] - (CENTER + 1000.0)).abs() < 1e-9);
    assert!((written.positions[1] - CENTER).abs() < 1e-9);
    assert!((written.positions[2] - (CENTER - 1000.0)).abs() < 1e-9);
}

#[test]
fn test_follower_observation_reads_back() {
    let mut rig = rig(LoopConfig {
        observation: ObservationSource::Follower,
        ..LoopConfig::default()
    });
    rig.control.connect().unwrap();
    let reads_after_connect = rig.follower.read_calls();

    rig.control.run(RunLimit::ticks(4)).unwrap();
    assert_eq!(rig.follower.read_calls(), reads_after_connect + 4);
    assert_eq!(rig.follower.write_count(), 4);
    assert_eq!(rig.follower.last_write().unwrap().len(), JOINTS);
}

#[test]
fn test_loop_can_run_again_after_reconnect() {
    let mut rig = rig(LoopConfig::default());
    rig.control.connect().unwrap();
    rig.control.run(RunLimit::ticks(2)).unwrap();
    assert!(matches!(
        rig.control.run(RunLimit::ticks(2)),
        Err(ControlError::InvalidState { .. })
    ));

    rig.control.connect().unwrap();
    let report = rig.control.run(RunLimit::duration(Duration::from_millis(100))).unwrap();
    assert_eq!(report.ticks, 3);
    assert_eq!(rig.follower.write_count(), 5);
}
