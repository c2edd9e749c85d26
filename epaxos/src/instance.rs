use std::collections::{BTreeMap, BTreeSet, HashMap};

use biometrics::Counter;

use epaxos_pb::{Ballot, Command, ReplicaID, Slot, Status};

use crate::deps::DepsStore;
use crate::timeout::TimeoutStore;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PLACEHOLDER_CREATED: Counter = Counter::new("epaxos.instance.placeholder");
static STALE_UPDATE: Counter = Counter::new("epaxos.instance.stale_update");
static COMMIT_DUPLICATE: Counter = Counter::new("epaxos.instance.commit_duplicate");

pub(crate) fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&PLACEHOLDER_CREATED);
    collector.register_counter(&STALE_UPDATE);
    collector.register_counter(&COMMIT_DUPLICATE);
}

///////////////////////////////////////////// Instance /////////////////////////////////////////////

/// The protocol record for one slot.  The slot never changes; the ballot never decreases; once
/// Committed, the command, sequence number, and dependencies are frozen.
#[derive(Clone, Debug)]
pub struct Instance {
    slot: Slot,
    status: Status,
    ballot: Ballot,
    command: Option<Command>,
    seq: u64,
    deps: BTreeSet<Slot>,
}

impl Instance {
    fn new(slot: Slot) -> Self {
        Self {
            slot,
            status: Status::Prepared,
            ballot: Ballot::BOTTOM,
            command: None,
            seq: 0,
            deps: BTreeSet::new(),
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn command(&self) -> Option<&Command> {
        self.command.as_ref()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn deps(&self) -> &BTreeSet<Slot> {
        &self.deps
    }

    pub fn committed(&self) -> bool {
        self.status >= Status::Committed
    }
}

/////////////////////////////////////////// InstanceStore //////////////////////////////////////////

/// Every instance this replica knows about, plus the interference index and the deadline tracker.
/// All writes funnel through this type so the three stay in sync and so a persistence layer has a
/// single choke point.  Transitions that would lower a ballot, regress a committed instance, or
/// replay an in-ballot phase are rejected.
pub struct InstanceStore {
    instances: BTreeMap<Slot, Instance>,
    deps: DepsStore,
    timeouts: TimeoutStore,
    executed_cut: HashMap<ReplicaID, i64>,
    jiffies: u64,
}

impl InstanceStore {
    pub fn new(replicas: &[ReplicaID], jiffies: u64) -> Self {
        let mut executed_cut = HashMap::new();
        for replica in replicas {
            executed_cut.insert(*replica, -1);
        }
        Self {
            instances: BTreeMap::new(),
            deps: DepsStore::new(),
            timeouts: TimeoutStore::new(),
            executed_cut,
            jiffies,
        }
    }

    pub fn get(&self, slot: Slot) -> Option<&Instance> {
        self.instances.get(&slot)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn iter_status(&self, status: Status) -> impl Iterator<Item = &Instance> {
        self.instances
            .values()
            .filter(move |inst| inst.status() == status)
    }

    /// Ensure an instance exists for `slot`.  A freshly created instance is a Prepared
    /// placeholder with a timeout armed, so an unreachable leader's slot eventually recovers.
    pub fn load_or_create(&mut self, slot: Slot, now: u64) -> &Instance {
        let jiffies = self.jiffies;
        let timeouts = &mut self.timeouts;
        self.instances.entry(slot).or_insert_with(|| {
            PLACEHOLDER_CREATED.click();
            timeouts.arm(slot, now + jiffies);
            Instance::new(slot)
        })
    }

    /// Interference query for `command`, were it to occupy `slot`.
    pub fn query_deps(&self, slot: Slot, command: &Command) -> (u64, BTreeSet<Slot>) {
        self.deps.query(slot, command)
    }

    /// Transition to PreAccepted with the given value.  Rejected below the current ballot, at the
    /// current ballot once the instance has advanced past PreAccepted, and always once committed.
    pub fn pre_accept(
        &mut self,
        slot: Slot,
        ballot: Ballot,
        command: Command,
        seq: u64,
        deps: BTreeSet<Slot>,
        now: u64,
    ) -> bool {
        let jiffies = self.jiffies;
        let inst = self.instances.entry(slot).or_insert_with(|| Instance::new(slot));
        if inst.status >= Status::Committed
            || ballot < inst.ballot
            || (ballot == inst.ballot && inst.status > Status::PreAccepted)
        {
            STALE_UPDATE.click();
            return false;
        }
        Self::reindex(&mut self.deps, slot, inst.command.as_ref(), &command, seq);
        inst.status = Status::PreAccepted;
        inst.ballot = ballot;
        inst.command = Some(command);
        inst.seq = seq;
        inst.deps = deps;
        self.timeouts.arm(slot, now + jiffies);
        true
    }

    /// Transition to Accepted with the given value.  Rejected below the current ballot and once
    /// committed.
    pub fn accept(
        &mut self,
        slot: Slot,
        ballot: Ballot,
        command: Command,
        seq: u64,
        deps: BTreeSet<Slot>,
        now: u64,
    ) -> bool {
        let jiffies = self.jiffies;
        let inst = self.instances.entry(slot).or_insert_with(|| Instance::new(slot));
        if inst.status >= Status::Committed || ballot < inst.ballot {
            STALE_UPDATE.click();
            return false;
        }
        Self::reindex(&mut self.deps, slot, inst.command.as_ref(), &command, seq);
        inst.status = Status::Accepted;
        inst.ballot = ballot;
        inst.command = Some(command);
        inst.seq = seq;
        inst.deps = deps;
        self.timeouts.arm(slot, now + jiffies);
        true
    }

    /// Transition to Committed and freeze the value.  Commit is authoritative at any ballot; a
    /// duplicate commit is a no-op and the call reports whether this was the first.
    pub fn commit(
        &mut self,
        slot: Slot,
        ballot: Ballot,
        command: Command,
        seq: u64,
        deps: BTreeSet<Slot>,
    ) -> bool {
        let inst = self.instances.entry(slot).or_insert_with(|| Instance::new(slot));
        if inst.status >= Status::Committed {
            COMMIT_DUPLICATE.click();
            return false;
        }
        Self::reindex(&mut self.deps, slot, inst.command.as_ref(), &command, seq);
        inst.status = Status::Committed;
        inst.ballot = std::cmp::max(inst.ballot, ballot);
        inst.command = Some(command);
        inst.seq = seq;
        inst.deps = deps;
        self.timeouts.disarm(slot);
        true
    }

    /// Raise the ballot without touching the value.  Rejected unless strictly greater, so a
    /// duplicated Prepare raises exactly once.
    pub fn raise_ballot(&mut self, slot: Slot, ballot: Ballot) -> bool {
        let inst = self.instances.entry(slot).or_insert_with(|| Instance::new(slot));
        if ballot <= inst.ballot {
            STALE_UPDATE.click();
            return false;
        }
        inst.ballot = ballot;
        true
    }

    /// Mark a committed instance executed and advance the executed cut over any now-contiguous
    /// prefix of its leader's instances.
    pub fn mark_executed(&mut self, slot: Slot) {
        let Some(inst) = self.instances.get_mut(&slot) else {
            return;
        };
        debug_assert_eq!(Status::Committed, inst.status);
        inst.status = Status::Executed;
        let cut = self.executed_cut.entry(slot.replica).or_insert(-1);
        loop {
            let next = Slot::new(slot.replica, (*cut + 1) as u64);
            match self.instances.get(&next) {
                Some(inst) if inst.status == Status::Executed => *cut += 1,
                _ => break,
            }
        }
    }

    /// Per replica, the highest instance index whose prefix is fully executed; -1 when none is.
    pub fn executed_cut(&self) -> &HashMap<ReplicaID, i64> {
        &self.executed_cut
    }

    pub fn status_counts(&self) -> BTreeMap<Status, usize> {
        let mut counts = BTreeMap::new();
        for inst in self.instances.values() {
            *counts.entry(inst.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn arm(&mut self, slot: Slot, deadline: u64) {
        self.timeouts.arm(slot, deadline);
    }

    pub fn disarm(&mut self, slot: Slot) {
        self.timeouts.disarm(slot);
    }

    pub fn expired(&mut self, now: u64) -> Vec<Slot> {
        self.timeouts.expired(now)
    }

    pub fn minimum_wait(&self, now: u64) -> Option<u64> {
        self.timeouts.minimum_wait(now)
    }

    // An instance whose command is rewritten (recovery replacing a value, or a no-op displacing a
    // tentative command) must not leave its old key in the interference index.
    fn reindex(
        deps: &mut DepsStore,
        slot: Slot,
        old: Option<&Command>,
        new: &Command,
        seq: u64,
    ) {
        if let Some(old) = old {
            if old.key() != new.key() {
                deps.remove(slot);
            }
        }
        deps.update(slot, new, seq);
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
