use std::collections::HashMap;

use epaxos_pb::Slot;

/////////////////////////////////////////// TimeoutStore ///////////////////////////////////////////

/// Deadlines for uncommitted instances, measured in logical ticks.  Every uncommitted instance
/// carries exactly one deadline; arming overwrites and committing disarms.
#[derive(Clone, Debug, Default)]
pub struct TimeoutStore {
    deadlines: HashMap<Slot, u64>,
}

impl TimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `slot` to expire at `deadline`, overwriting any prior deadline.
    pub fn arm(&mut self, slot: Slot, deadline: u64) {
        self.deadlines.insert(slot, deadline);
    }

    pub fn disarm(&mut self, slot: Slot) {
        self.deadlines.remove(&slot);
    }

    pub fn is_armed(&self, slot: Slot) -> bool {
        self.deadlines.contains_key(&slot)
    }

    /// Return and clear every deadline at or before `now`, in slot order.
    pub fn expired(&mut self, now: u64) -> Vec<Slot> {
        let mut due: Vec<Slot> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(slot, _)| *slot)
            .collect();
        due.sort();
        for slot in due.iter() {
            self.deadlines.remove(slot);
        }
        due
    }

    /// The smallest positive delay until the next deadline, if any deadline is armed.
    pub fn minimum_wait(&self, now: u64) -> Option<u64> {
        self.deadlines
            .values()
            .map(|deadline| std::cmp::max(deadline.saturating_sub(now), 1))
            .min()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use epaxos_pb::ReplicaID;

    use super::*;

    fn slot(replica: u32, index: u64) -> Slot {
        Slot::new(ReplicaID::new(replica), index)
    }

    #[test]
    fn arm_overwrites() {
        let mut timeouts = TimeoutStore::new();
        timeouts.arm(slot(1, 0), 10);
        timeouts.arm(slot(1, 0), 20);
        assert!(timeouts.expired(15).is_empty());
        assert_eq!(vec![slot(1, 0)], timeouts.expired(20));
    }

    #[test]
    fn expired_drains() {
        let mut timeouts = TimeoutStore::new();
        timeouts.arm(slot(1, 0), 10);
        timeouts.arm(slot(2, 0), 10);
        timeouts.arm(slot(3, 0), 11);
        assert_eq!(vec![slot(1, 0), slot(2, 0)], timeouts.expired(10));
        assert!(timeouts.expired(10).is_empty());
        assert!(timeouts.is_armed(slot(3, 0)));
    }

    #[test]
    fn disarm() {
        let mut timeouts = TimeoutStore::new();
        timeouts.arm(slot(1, 0), 10);
        timeouts.disarm(slot(1, 0));
        assert!(timeouts.expired(10).is_empty());
        assert_eq!(None, timeouts.minimum_wait(0));
    }

    #[test]
    fn minimum_wait_is_positive() {
        let mut timeouts = TimeoutStore::new();
        timeouts.arm(slot(1, 0), 10);
        assert_eq!(Some(7), timeouts.minimum_wait(3));
        assert_eq!(Some(1), timeouts.minimum_wait(10));
        assert_eq!(Some(1), timeouts.minimum_wait(25));
    }
}
