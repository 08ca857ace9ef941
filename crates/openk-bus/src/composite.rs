//! 复合总线：把多条总线按顺序拼成一条关节向量
//!
//! 复合总线上的执行器 ID 为 `段序号 << 12 | 段内 ID`，避免不同总线的 ID 冲突。

use crate::{ActuatorBus, BusError, BusKind, JointState};
use std::collections::BTreeSet;

const SEGMENT_SHIFT: u16 = 12;

/// 一段子总线
pub type Segment = Box<dyn ActuatorBus + Send>;

/// 复合总线
pub struct CompositeBus {
    segments: Vec<Segment>,
}

impl CompositeBus {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// 段内 ID → 复合 ID
    pub const fn compose_id(segment: usize, id: u16) -> u16 {
        ((segment as u16) << SEGMENT_SHIFT) | (id & 0x0FFF)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl ActuatorBus for CompositeBus {
    fn kind(&self) -> BusKind {
        BusKind::Composite
    }

    fn joint_ids(&self) -> Vec<u16> {
        self.segments
            .iter()
            .enumerate()
            .flat_map(|(i, bus)| {
                bus.joint_ids()
                    .into_iter()
                    .map(move |id| Self::compose_id(i, id))
            })
            .collect()
    }

    fn probe(&mut self) -> Result<BTreeSet<u16>, BusError> {
        let mut present = BTreeSet::new();
        for (i, bus) in self.segments.iter_mut().enumerate() {
            present.extend(bus.probe()?.into_iter().map(|id| Self::compose_id(i, id)));
        }
        Ok(present)
    }

    fn read_positions(&mut self) -> Result<JointState, BusError> {
        let mut state = JointState::default();
        for bus in &mut self.segments {
            let part = bus.read_positions()?;
            state.positions.extend(part.positions);
        }
        Ok(state)
    }

    fn write_positions(&mut self, positions: &JointState) -> Result<(), BusError> {
        let expected: usize = self.segments.iter().map(|b| b.len()).sum();
        if positions.len() != expected {
            return Err(BusError::LengthMismatch {
                expected,
                actual: positions.len(),
            });
        }
        let mut offset = 0;
        for bus in &mut self.segments {
            let n = bus.len();
            let part = JointState::from_positions(positions.positions[offset..offset + n].iter().copied());
            bus.write_positions(&part)?;
            offset += n;
        }
        Ok(())
    }

    fn set_torque(&mut self, enabled: bool) -> Result<(), BusError> {
        for bus in &mut self.segments {
            bus.set_torque(enabled)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;

    #[test]
    fn test_concatenates_segments() {
        let (damiao, damiao_handle) = MockBus::new(&[1, 2, 3]);
        let (sts, sts_handle) = MockBus::new(&[1, 2]);
        damiao_handle.set_positions(&[0.1, 0.2, 0.3]);
        sts_handle.set_positions(&[100.0, 200.0]);

        let mut bus = CompositeBus::new(vec![Box::new(damiao) as Segment, Box::new(sts)]);
        assert_eq!(bus.joint_ids(), vec![1, 2, 3, 0x1001, 0x1002]);
        assert_eq!(bus.len(), 5);

        let state = bus.read_positions().unwrap();
        assert_eq!(state.positions.as_slice(), &[0.1, 0.2, 0.3, 100.0, 200.0]);

        bus.write_positions(&JointState::from_positions([1.0, 2.0, 3.0, 4.0, 5.0]))
            .unwrap();
        assert_eq!(damiao_handle.last_write().unwrap().positions.as_slice(), &[1.0, 2.0, 3.0]);
        assert_eq!(sts_handle.last_write().unwrap().positions.as_slice(), &[4.0, 5.0]);
    }

    #[test]
    fn test_probe_union_and_length_check() {
        let (a, _) = MockBus::new(&[1]);
        let (b, b_handle) = MockBus::new(&[1, 2]);
        b_handle.remove_actuator(2);
        let mut bus = CompositeBus::new(vec![Box::new(a) as Segment, Box::new(b)]);

        let present = bus.probe().unwrap();
        assert_eq!(present.into_iter().collect::<Vec<_>>(), vec![1, 0x1001]);

        let err = bus
            .write_positions(&JointState::from_positions([0.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, BusError::LengthMismatch { expected: 3, actual: 2 }));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn composed_ids_are_unique_across_segments(
                a in 0u16..0x1000,
                b in 0u16..0x1000,
                sa in 0usize..15,
                sb in 0usize..15,
            ) {
                let same = CompositeBus::compose_id(sa, a) == CompositeBus::compose_id(sb, b);
                prop_assert_eq!(same, sa == sb && a == b);
            }
        }
    }
}
