use biometrics::Counter;

use indicio::{clue, INFO};

use epaxos_pb::{
    AcceptAck, AcceptNack, AcceptRequest, CommitRequest, PeerID, PreAcceptAck, PreAcceptNack,
    PreAcceptRequest, PrepareAck, PrepareNack, PrepareRequest, ReplicaMessage,
};

use crate::replica::{Environment, Replica};
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PRE_ACCEPT_REQUEST: Counter = Counter::new("epaxos.acceptor.pre_accept");
static ACCEPT_REQUEST: Counter = Counter::new("epaxos.acceptor.accept");
static COMMIT_REQUEST: Counter = Counter::new("epaxos.acceptor.commit");
static PREPARE_REQUEST: Counter = Counter::new("epaxos.acceptor.prepare");
static STALE_BALLOT: Counter = Counter::new("epaxos.acceptor.stale_ballot");
static COMMITTED_SLOT_IGNORED: Counter = Counter::new("epaxos.acceptor.committed_slot_ignored");

pub(crate) fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&PRE_ACCEPT_REQUEST);
    collector.register_counter(&ACCEPT_REQUEST);
    collector.register_counter(&COMMIT_REQUEST);
    collector.register_counter(&PREPARE_REQUEST);
    collector.register_counter(&STALE_BALLOT);
    collector.register_counter(&COMMITTED_SLOT_IGNORED);
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

impl Replica {
    pub(crate) fn on_pre_accept_request(
        &mut self,
        env: &mut Environment,
        from: PeerID,
        req: PreAcceptRequest,
    ) {
        PRE_ACCEPT_REQUEST.click();
        let now = self.state.ticks();
        let inst = self.store.load_or_create(req.slot, now);
        if inst.committed() {
            COMMITTED_SLOT_IGNORED.click();
            return;
        }
        if req.ballot < inst.ballot() {
            STALE_BALLOT.click();
            clue!(COLLECTOR, INFO, {
                pre_accept_nack: {
                    slot: format!("{}", req.slot),
                    theirs: format!("{}", req.ballot),
                    ours: format!("{}", inst.ballot()),
                },
            });
            env.send(
                from,
                &ReplicaMessage::PreAcceptNack(PreAcceptNack { slot: req.slot }),
            );
            return;
        }
        for dep in req.deps.iter() {
            self.store.load_or_create(*dep, now);
        }
        let (floor, local_deps) = self.store.query_deps(req.slot, &req.command);
        let seq = std::cmp::max(req.seq, floor);
        let mut deps = local_deps;
        deps.extend(req.deps.iter().copied());
        if !self
            .store
            .pre_accept(req.slot, req.ballot, req.command, seq, deps.clone(), now)
        {
            return;
        }
        env.send(
            from,
            &ReplicaMessage::PreAcceptAck(PreAcceptAck {
                slot: req.slot,
                ballot: req.ballot,
                seq,
                deps: deps.into_iter().collect(),
            }),
        );
    }

    pub(crate) fn on_accept_request(
        &mut self,
        env: &mut Environment,
        from: PeerID,
        req: AcceptRequest,
    ) {
        ACCEPT_REQUEST.click();
        let now = self.state.ticks();
        let inst = self.store.load_or_create(req.slot, now);
        if inst.committed() {
            COMMITTED_SLOT_IGNORED.click();
            return;
        }
        if req.ballot < inst.ballot() {
            STALE_BALLOT.click();
            env.send(
                from,
                &ReplicaMessage::AcceptNack(AcceptNack {
                    slot: req.slot,
                    ballot: inst.ballot(),
                }),
            );
            return;
        }
        for dep in req.deps.iter() {
            self.store.load_or_create(*dep, now);
        }
        let deps = req.deps.iter().copied().collect();
        if !self
            .store
            .accept(req.slot, req.ballot, req.command, req.seq, deps, now)
        {
            return;
        }
        env.send(
            from,
            &ReplicaMessage::AcceptAck(AcceptAck {
                slot: req.slot,
                ballot: req.ballot,
            }),
        );
    }

    pub(crate) fn on_commit_request(&mut self, _: &mut Environment, req: CommitRequest) {
        COMMIT_REQUEST.click();
        let now = self.state.ticks();
        self.store.load_or_create(req.slot, now);
        for dep in req.deps.iter() {
            self.store.load_or_create(*dep, now);
        }
        let deps = req.deps.iter().copied().collect();
        if self
            .store
            .commit(req.slot, req.ballot, req.command, req.seq, deps)
        {
            self.backoff.remove(&req.slot);
            self.executor.enqueue(req.slot);
        }
    }

    pub(crate) fn on_prepare_request(
        &mut self,
        env: &mut Environment,
        from: PeerID,
        req: PrepareRequest,
    ) {
        PREPARE_REQUEST.click();
        let now = self.state.ticks();
        let inst = self.store.load_or_create(req.slot, now);
        if req.ballot <= inst.ballot() {
            STALE_BALLOT.click();
            clue!(COLLECTOR, INFO, {
                prepare_nack: {
                    slot: format!("{}", req.slot),
                    theirs: format!("{}", req.ballot),
                    ours: format!("{}", inst.ballot()),
                },
            });
            env.send(
                from,
                &ReplicaMessage::PrepareNack(PrepareNack { slot: req.slot }),
            );
            return;
        }
        let ack = PrepareAck {
            slot: req.slot,
            ballot: inst.ballot(),
            command: inst.command().cloned().unwrap_or_default(),
            seq: inst.seq(),
            deps: inst.deps().iter().copied().collect(),
            status: inst.status(),
        };
        self.store.raise_ballot(req.slot, req.ballot);
        env.send(from, &ReplicaMessage::PrepareAck(ack));
    }
}
