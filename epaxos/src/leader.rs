use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use biometrics::Counter;

use indicio::{clue, INFO};

use epaxos_pb::{
    AcceptAck, AcceptNack, AcceptRequest, Ballot, ClientRequest, Command, CommitRequest, PeerID,
    PreAcceptAck, PreAcceptNack, PreAcceptRequest, PrepareAck, PrepareNack, PrepareRequest,
    ReplicaID, ReplicaMessage, Slot, Status,
};

use crate::replica::{Environment, Replica};
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CLIENT_REQUEST: Counter = Counter::new("epaxos.leader.client_request");
static FAST_PATH: Counter = Counter::new("epaxos.leader.fast_path");
static SLOW_PATH: Counter = Counter::new("epaxos.leader.slow_path");
static PRE_ACCEPT_NACKED: Counter = Counter::new("epaxos.leader.pre_accept_nacked");
static ACCEPT_NACKED: Counter = Counter::new("epaxos.leader.accept_nacked");
static PREPARE_NACKED: Counter = Counter::new("epaxos.leader.prepare_nacked");
static RECOVERY: Counter = Counter::new("epaxos.leader.recovery");
static RECOVERY_COMMITTED: Counter = Counter::new("epaxos.leader.recovery.committed");
static RECOVERY_ACCEPTED: Counter = Counter::new("epaxos.leader.recovery.accepted");
static RECOVERY_PRE_ACCEPTED: Counter = Counter::new("epaxos.leader.recovery.pre_accepted");
static RECOVERY_NOP: Counter = Counter::new("epaxos.leader.recovery.nop");
static COMMITTED: Counter = Counter::new("epaxos.leader.committed");

pub(crate) fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&CLIENT_REQUEST);
    collector.register_counter(&FAST_PATH);
    collector.register_counter(&SLOW_PATH);
    collector.register_counter(&PRE_ACCEPT_NACKED);
    collector.register_counter(&ACCEPT_NACKED);
    collector.register_counter(&PREPARE_NACKED);
    collector.register_counter(&RECOVERY);
    collector.register_counter(&RECOVERY_COMMITTED);
    collector.register_counter(&RECOVERY_ACCEPTED);
    collector.register_counter(&RECOVERY_PRE_ACCEPTED);
    collector.register_counter(&RECOVERY_NOP);
    collector.register_counter(&COMMITTED);
}

/////////////////////////////////////////// PrepareReply ///////////////////////////////////////////

/// One acceptor's pre-raise view of an instance, as carried by PrepareAck.
#[derive(Clone, Debug)]
pub(crate) struct PrepareReply {
    ballot: Ballot,
    status: Status,
    command: Command,
    seq: u64,
    deps: BTreeSet<Slot>,
}

////////////////////////////////////////////// Driver //////////////////////////////////////////////

/// The per-slot state machine for a slot this replica is driving, either as the original leader
/// or as a recoverer.  Substates promote by explicit transition; a payload never mutates across
/// states.
#[derive(Debug)]
pub(crate) enum Driver {
    AwaitingPreAccept {
        ballot: Ballot,
        command: Command,
        seq: u64,
        deps: BTreeSet<Slot>,
        replies: HashMap<ReplicaID, (u64, BTreeSet<Slot>)>,
    },
    AwaitingAccept {
        ballot: Ballot,
        command: Command,
        seq: u64,
        deps: BTreeSet<Slot>,
        acks: HashSet<ReplicaID>,
    },
    AwaitingPrepare {
        ballot: Ballot,
        replies: HashMap<ReplicaID, PrepareReply>,
    },
    Done,
}

////////////////////////////////////////////// Leader //////////////////////////////////////////////

impl Replica {
    pub(crate) fn on_client_request(&mut self, env: &mut Environment, req: ClientRequest) {
        CLIENT_REQUEST.click();
        let slot = self.state.next_slot();
        let ballot = self.state.initial_ballot();
        self.clients.insert(slot, req.client);
        let driver = self.enter_pre_accept(env, slot, ballot, req.command);
        self.drivers.insert(slot, driver);
    }

    pub(crate) fn on_pre_accept_ack(
        &mut self,
        env: &mut Environment,
        from: ReplicaID,
        ack: PreAcceptAck,
    ) {
        if self.retire_if_committed(ack.slot) {
            return;
        }
        let Some(driver) = self.drivers.remove(&ack.slot) else {
            return;
        };
        let Driver::AwaitingPreAccept {
            ballot,
            command,
            seq,
            deps,
            mut replies,
        } = driver
        else {
            self.drivers.insert(ack.slot, driver);
            return;
        };
        if ack.ballot != ballot || !self.state.is_replica(from) {
            self.drivers.insert(
                ack.slot,
                Driver::AwaitingPreAccept {
                    ballot,
                    command,
                    seq,
                    deps,
                    replies,
                },
            );
            return;
        }
        replies.insert(from, (ack.seq, ack.deps.iter().copied().collect()));
        let next = self.advance_pre_accept(env, ack.slot, ballot, &command, seq, &deps, &replies);
        let driver = next.unwrap_or(Driver::AwaitingPreAccept {
            ballot,
            command,
            seq,
            deps,
            replies,
        });
        self.drivers.insert(ack.slot, driver);
    }

    pub(crate) fn on_pre_accept_nack(&mut self, _: &mut Environment, nack: PreAcceptNack) {
        let Some(driver) = self.drivers.get_mut(&nack.slot) else {
            return;
        };
        if matches!(driver, Driver::AwaitingPreAccept { .. }) {
            PRE_ACCEPT_NACKED.click();
            clue!(COLLECTOR, INFO, {
                pre_accept_abandoned: format!("{}", nack.slot),
            });
            // A peer holds a higher ballot.  Abandon; the timeout drives recovery.
            *driver = Driver::Done;
        }
    }

    pub(crate) fn on_accept_ack(&mut self, env: &mut Environment, from: ReplicaID, ack: AcceptAck) {
        if self.retire_if_committed(ack.slot) {
            return;
        }
        let Some(driver) = self.drivers.remove(&ack.slot) else {
            return;
        };
        let Driver::AwaitingAccept {
            ballot,
            command,
            seq,
            deps,
            mut acks,
        } = driver
        else {
            self.drivers.insert(ack.slot, driver);
            return;
        };
        if ack.ballot != ballot || !self.state.is_replica(from) {
            self.drivers.insert(
                ack.slot,
                Driver::AwaitingAccept {
                    ballot,
                    command,
                    seq,
                    deps,
                    acks,
                },
            );
            return;
        }
        acks.insert(from);
        if acks.len() + 1 >= self.state.quorum_full() {
            self.commit_and_broadcast(env, ack.slot, ballot, command, seq, deps);
            self.drivers.insert(ack.slot, Driver::Done);
        } else {
            self.drivers.insert(
                ack.slot,
                Driver::AwaitingAccept {
                    ballot,
                    command,
                    seq,
                    deps,
                    acks,
                },
            );
        }
    }

    pub(crate) fn on_accept_nack(&mut self, _: &mut Environment, nack: AcceptNack) {
        let Some(driver) = self.drivers.get_mut(&nack.slot) else {
            return;
        };
        if matches!(driver, Driver::AwaitingAccept { .. }) {
            ACCEPT_NACKED.click();
            // Learn the superseding ballot so the next recovery attempt clears it.
            self.store.raise_ballot(nack.slot, nack.ballot);
            *driver = Driver::Done;
        }
    }

    /// Timeout-driven recovery.  Claim the slot at a superseding ballot and rally a majority of
    /// views; the most advanced surviving value (or a no-op) is re-proposed.
    pub(crate) fn begin_recovery(&mut self, env: &mut Environment, slot: Slot) {
        let now = self.state.ticks();
        let Some(inst) = self.store.get(slot) else {
            return;
        };
        if inst.committed() {
            return;
        }
        RECOVERY.click();
        let floor = std::cmp::max(
            inst.ballot(),
            Ballot::initial(self.state.epoch(), slot.replica),
        );
        let ballot = floor.superseding(self.state.id());
        let reply = PrepareReply {
            ballot: inst.ballot(),
            status: inst.status(),
            command: inst.command().cloned().unwrap_or_default(),
            seq: inst.seq(),
            deps: inst.deps().clone(),
        };
        let attempt = {
            let attempt = self.backoff.entry(slot).or_insert(0);
            *attempt += 1;
            *attempt
        };
        clue!(COLLECTOR, INFO, {
            recovery: {
                slot: format!("{}", slot),
                ballot: format!("{}", ballot),
                attempt: attempt,
            },
        });
        self.store.raise_ballot(slot, ballot);
        let delay = self.state.backoff_delay(attempt);
        self.store.arm(slot, now + delay);
        let mut replies = HashMap::new();
        replies.insert(self.state.id(), reply);
        self.broadcast(
            env,
            &ReplicaMessage::PrepareRequest(PrepareRequest { slot, ballot }),
        );
        self.drivers
            .insert(slot, Driver::AwaitingPrepare { ballot, replies });
    }

    pub(crate) fn on_prepare_ack(&mut self, env: &mut Environment, from: ReplicaID, ack: PrepareAck) {
        if self.retire_if_committed(ack.slot) {
            return;
        }
        let Some(driver) = self.drivers.remove(&ack.slot) else {
            return;
        };
        let Driver::AwaitingPrepare { ballot, mut replies } = driver else {
            self.drivers.insert(ack.slot, driver);
            return;
        };
        if !self.state.is_replica(from) {
            self.drivers
                .insert(ack.slot, Driver::AwaitingPrepare { ballot, replies });
            return;
        }
        replies.insert(
            from,
            PrepareReply {
                ballot: ack.ballot,
                status: ack.status,
                command: ack.command,
                seq: ack.seq,
                deps: ack.deps.iter().copied().collect(),
            },
        );
        let next = self.decide_prepare(env, ack.slot, ballot, &replies);
        let driver = next.unwrap_or(Driver::AwaitingPrepare { ballot, replies });
        self.drivers.insert(ack.slot, driver);
    }

    pub(crate) fn on_prepare_nack(&mut self, _: &mut Environment, nack: PrepareNack) {
        let Some(driver) = self.drivers.get_mut(&nack.slot) else {
            return;
        };
        if matches!(driver, Driver::AwaitingPrepare { .. }) {
            PREPARE_NACKED.click();
            clue!(COLLECTOR, INFO, {
                prepare_abandoned: format!("{}", nack.slot),
            });
            // A competing recoverer is ahead.  Back off; the re-armed timeout retries with a
            // larger ballot.
            *driver = Driver::Done;
        }
    }

    /// Decide whether the pre-accept phase can conclude.  Returns the successor driver once the
    /// fast path commits or the slow path begins; None keeps collecting.
    fn advance_pre_accept(
        &mut self,
        env: &mut Environment,
        slot: Slot,
        ballot: Ballot,
        command: &Command,
        seq: u64,
        deps: &BTreeSet<Slot>,
        replies: &HashMap<ReplicaID, (u64, BTreeSet<Slot>)>,
    ) -> Option<Driver> {
        let identical = replies
            .values()
            .filter(|(s, d)| *s == seq && d == deps)
            .count();
        let total = replies.len();
        let peers = self.state.replicas().len() - 1;
        let fast_allowed = self.state.fast_path_enabled()
            && ballot == Ballot::initial(self.state.epoch(), slot.replica);
        if fast_allowed && identical >= self.state.quorum_fast() {
            FAST_PATH.click();
            clue!(COLLECTOR, INFO, {
                fast_path: format!("{}", slot),
            });
            self.commit_and_broadcast(env, slot, ballot, command.clone(), seq, deps.clone());
            return Some(Driver::Done);
        }
        if fast_allowed && identical + (peers - total) >= self.state.quorum_fast() {
            // The fast path is still reachable; hold out for the remaining peers.
            return None;
        }
        if total + 1 >= self.state.quorum_full() {
            let seq = std::cmp::max(seq, replies.values().map(|(s, _)| *s).max().unwrap_or(0));
            let mut deps = deps.clone();
            for (_, d) in replies.values() {
                deps.extend(d.iter().copied());
            }
            return Some(self.enter_slow_path(env, slot, ballot, command.clone(), seq, deps));
        }
        None
    }

    /// The recovery verdict, applied in priority order over a majority of views.
    fn decide_prepare(
        &mut self,
        env: &mut Environment,
        slot: Slot,
        ballot: Ballot,
        replies: &HashMap<ReplicaID, PrepareReply>,
    ) -> Option<Driver> {
        // A committed view short-circuits the majority wait.
        if let Some(reply) = replies.values().find(|r| r.status >= Status::Committed) {
            RECOVERY_COMMITTED.click();
            self.commit_and_broadcast(
                env,
                slot,
                ballot,
                reply.command.clone(),
                reply.seq,
                reply.deps.clone(),
            );
            return Some(Driver::Done);
        }
        if replies.len() < self.state.quorum_full() {
            return None;
        }
        let views = replies.len() as u64;
        clue!(COLLECTOR, INFO, {
            recovery_verdict: {
                slot: format!("{}", slot),
                views: views,
            },
        });
        // An accepted view at the highest ballot may already be chosen; finish its slow path.
        if let Some(reply) = replies
            .values()
            .filter(|r| r.status == Status::Accepted)
            .max_by_key(|r| r.ballot)
        {
            RECOVERY_ACCEPTED.click();
            return Some(self.enter_slow_path(
                env,
                slot,
                ballot,
                reply.command.clone(),
                reply.seq,
                reply.deps.clone(),
            ));
        }
        // Half the ensemble pre-accepted one value at the slot's initial ballot, not counting the
        // original leader:  that value may have fast-committed, so it must survive.
        let original = Ballot::initial(self.state.epoch(), slot.replica);
        let mut groups: BTreeMap<(u64, Vec<Slot>), (usize, Command)> = BTreeMap::new();
        for (from, reply) in replies.iter() {
            if reply.status != Status::PreAccepted
                || reply.ballot != original
                || *from == slot.replica
            {
                continue;
            }
            let key = (reply.seq, reply.deps.iter().copied().collect::<Vec<_>>());
            let entry = groups.entry(key).or_insert((0, reply.command.clone()));
            entry.0 += 1;
        }
        let n = self.state.replicas().len();
        if let Some(((seq, deps), (_, command))) =
            groups.iter().find(|(_, (count, _))| count * 2 >= n)
        {
            RECOVERY_PRE_ACCEPTED.click();
            return Some(self.enter_slow_path(
                env,
                slot,
                ballot,
                command.clone(),
                *seq,
                deps.iter().copied().collect(),
            ));
        }
        // Any surviving pre-accepted value restarts the full protocol.
        if let Some(reply) = replies
            .values()
            .filter(|r| r.status == Status::PreAccepted)
            .max_by_key(|r| r.ballot)
        {
            RECOVERY_PRE_ACCEPTED.click();
            let command = reply.command.clone();
            return Some(self.enter_pre_accept(env, slot, ballot, command));
        }
        // Nothing survived; fill the slot with a no-op so execution can move past it.
        RECOVERY_NOP.click();
        clue!(COLLECTOR, INFO, {
            recovery_nop: format!("{}", slot),
        });
        Some(self.enter_pre_accept(env, slot, ballot, Command::Nop))
    }

    /// Write PreAccepted locally and solicit the interference every peer has witnessed.
    pub(crate) fn enter_pre_accept(
        &mut self,
        env: &mut Environment,
        slot: Slot,
        ballot: Ballot,
        command: Command,
    ) -> Driver {
        let now = self.state.ticks();
        self.store.load_or_create(slot, now);
        let (floor, deps) = self.store.query_deps(slot, &command);
        let seq = floor;
        self.store
            .pre_accept(slot, ballot, command.clone(), seq, deps.clone(), now);
        self.broadcast(
            env,
            &ReplicaMessage::PreAcceptRequest(PreAcceptRequest {
                slot,
                ballot,
                command: command.clone(),
                seq,
                deps: deps.iter().copied().collect(),
            }),
        );
        Driver::AwaitingPreAccept {
            ballot,
            command,
            seq,
            deps,
            replies: HashMap::new(),
        }
    }

    /// Write Accepted locally and fix the value with a majority.
    fn enter_slow_path(
        &mut self,
        env: &mut Environment,
        slot: Slot,
        ballot: Ballot,
        command: Command,
        seq: u64,
        deps: BTreeSet<Slot>,
    ) -> Driver {
        SLOW_PATH.click();
        let now = self.state.ticks();
        self.store
            .accept(slot, ballot, command.clone(), seq, deps.clone(), now);
        self.broadcast(
            env,
            &ReplicaMessage::AcceptRequest(AcceptRequest {
                slot,
                ballot,
                command: command.clone(),
                seq,
                deps: deps.iter().copied().collect(),
            }),
        );
        Driver::AwaitingAccept {
            ballot,
            command,
            seq,
            deps,
            acks: HashSet::new(),
        }
    }

    pub(crate) fn commit_and_broadcast(
        &mut self,
        env: &mut Environment,
        slot: Slot,
        ballot: Ballot,
        command: Command,
        seq: u64,
        deps: BTreeSet<Slot>,
    ) {
        COMMITTED.click();
        clue!(COLLECTOR, INFO, {
            committed: {
                slot: format!("{}", slot),
                ballot: format!("{}", ballot),
                seq: seq,
            },
        });
        self.backoff.remove(&slot);
        if self
            .store
            .commit(slot, ballot, command.clone(), seq, deps.clone())
        {
            self.executor.enqueue(slot);
        }
        self.broadcast(
            env,
            &ReplicaMessage::CommitRequest(CommitRequest {
                slot,
                ballot,
                seq,
                command,
                deps: deps.into_iter().collect(),
            }),
        );
    }

    fn broadcast(&self, env: &mut Environment, msg: &ReplicaMessage) {
        for peer in self.state.peers() {
            env.send(PeerID::from(peer), msg);
        }
    }

    // A commit that arrived from a peer outranks whatever this driver was negotiating.
    fn retire_if_committed(&mut self, slot: Slot) -> bool {
        if self.store.get(slot).map(|inst| inst.committed()) != Some(true) {
            return false;
        }
        if let Some(driver) = self.drivers.get_mut(&slot) {
            *driver = Driver::Done;
        }
        true
    }
}
