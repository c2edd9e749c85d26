use std::collections::{BTreeSet, HashMap};

use epaxos_pb::{Command, ReplicaID, Slot};

///////////////////////////////////////////// Recorded /////////////////////////////////////////////

#[derive(Clone, Copy, Debug)]
struct Recorded {
    slot: Slot,
    seq: u64,
}

///////////////////////////////////////////// DepsStore ////////////////////////////////////////////

/// The interference index.  For each key, the store remembers the greatest slot each replica has
/// led against that key, along with its sequence number.  This is sufficient to answer "what does
/// a new command against this key depend upon?"  because each leader's earlier instances are
/// transitive dependencies of its latest.
///
/// No-ops bypass the store entirely.
#[derive(Clone, Debug, Default)]
pub struct DepsStore {
    by_key: HashMap<Vec<u8>, HashMap<ReplicaID, Recorded>>,
    by_slot: HashMap<Slot, Vec<u8>>,
}

impl DepsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slots that interfere with `command`, excluding `slot` itself, and the sequence floor:
    /// one more than the greatest sequence number recorded against the command's key.
    pub fn query(&self, slot: Slot, command: &Command) -> (u64, BTreeSet<Slot>) {
        let Some(key) = command.key() else {
            return (0, BTreeSet::new());
        };
        let mut deps = BTreeSet::new();
        let mut max_seq = 0;
        if let Some(owners) = self.by_key.get(key) {
            for recorded in owners.values() {
                if recorded.slot == slot {
                    continue;
                }
                deps.insert(recorded.slot);
                max_seq = std::cmp::max(max_seq, recorded.seq);
            }
        }
        (max_seq + 1, deps)
    }

    /// Record that `slot` now carries `command` at `seq`.  An entry for the same key and owner is
    /// only displaced by a greater slot, so the index always reflects the highest slot seen per
    /// (key, owner).
    pub fn update(&mut self, slot: Slot, command: &Command, seq: u64) {
        let Some(key) = command.key() else {
            return;
        };
        let owners = self.by_key.entry(key.to_vec()).or_default();
        if let Some(prev) = owners.get(&slot.replica) {
            if prev.slot > slot {
                return;
            }
            if prev.slot != slot {
                self.by_slot.remove(&prev.slot);
            }
        }
        owners.insert(slot.replica, Recorded { slot, seq });
        self.by_slot.insert(slot, key.to_vec());
    }

    /// Reverse an update.  Used when recovery rewrites an instance's command.
    pub fn remove(&mut self, slot: Slot) {
        let Some(key) = self.by_slot.remove(&slot) else {
            return;
        };
        if let Some(owners) = self.by_key.get_mut(&key) {
            if owners.get(&slot.replica).map(|r| r.slot) == Some(slot) {
                owners.remove(&slot.replica);
            }
            if owners.is_empty() {
                self.by_key.remove(&key);
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(replica: u32, index: u64) -> Slot {
        Slot::new(ReplicaID::new(replica), index)
    }

    #[test]
    fn empty_store() {
        let store = DepsStore::new();
        let (floor, deps) = store.query(slot(1, 0), &Command::op(b"k", b"v"));
        assert_eq!(1, floor);
        assert!(deps.is_empty());
    }

    #[test]
    fn nop_bypasses() {
        let mut store = DepsStore::new();
        store.update(slot(1, 0), &Command::Nop, 5);
        let (floor, deps) = store.query(slot(2, 0), &Command::Nop);
        assert_eq!(0, floor);
        assert!(deps.is_empty());
    }

    #[test]
    fn interference_and_floor() {
        let mut store = DepsStore::new();
        store.update(slot(1, 0), &Command::op(b"k", b"x"), 1);
        store.update(slot(2, 0), &Command::op(b"k", b"y"), 2);
        store.update(slot(3, 0), &Command::op(b"other", b"z"), 7);
        let (floor, deps) = store.query(slot(2, 1), &Command::op(b"k", b"w"));
        assert_eq!(3, floor);
        assert_eq!(
            vec![slot(1, 0), slot(2, 0)],
            deps.into_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn query_excludes_self() {
        let mut store = DepsStore::new();
        store.update(slot(1, 0), &Command::op(b"k", b"x"), 1);
        let (floor, deps) = store.query(slot(1, 0), &Command::op(b"k", b"x"));
        assert_eq!(1, floor);
        assert!(deps.is_empty());
    }

    #[test]
    fn greatest_slot_per_owner_wins() {
        let mut store = DepsStore::new();
        store.update(slot(1, 5), &Command::op(b"k", b"x"), 6);
        store.update(slot(1, 3), &Command::op(b"k", b"y"), 4);
        let (floor, deps) = store.query(slot(2, 0), &Command::op(b"k", b"z"));
        assert_eq!(7, floor);
        assert_eq!(vec![slot(1, 5)], deps.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn remove_reverses_update() {
        let mut store = DepsStore::new();
        store.update(slot(1, 0), &Command::op(b"k", b"x"), 1);
        store.remove(slot(1, 0));
        let (floor, deps) = store.query(slot(2, 0), &Command::op(b"k", b"y"));
        assert_eq!(1, floor);
        assert!(deps.is_empty());
    }

    #[test]
    fn remove_respects_displacement() {
        let mut store = DepsStore::new();
        store.update(slot(1, 0), &Command::op(b"k", b"x"), 1);
        store.update(slot(1, 4), &Command::op(b"k", b"y"), 2);
        // The entry for slot (1,0) was displaced; removing it must not disturb (1,4).
        store.remove(slot(1, 0));
        let (floor, deps) = store.query(slot(2, 0), &Command::op(b"k", b"z"));
        assert_eq!(3, floor);
        assert_eq!(vec![slot(1, 4)], deps.into_iter().collect::<Vec<_>>());
    }
}
