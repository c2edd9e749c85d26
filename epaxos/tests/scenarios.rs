//! Three-replica protocol walkthroughs with hand-controlled delivery, so crashes, drops, and
//! interleavings are exact.

use std::collections::{HashMap, HashSet, VecDeque};

use buffertk::{stack_pack, Unpackable};

use epaxos_pb::{
    Ballot, Command, CommitRequest, PeerID, PreAcceptRequest, PrepareRequest, ReplicaID,
    ReplicaMessage, Slot, Status,
};

use epaxos::{Environment, Replica, ReplicaOptions};

////////////////////////////////////////////// helpers /////////////////////////////////////////////

const JIFFIES: u64 = 20;

fn rid(id: u32) -> ReplicaID {
    ReplicaID::new(id)
}

fn pid(id: u32) -> PeerID {
    PeerID::new(id)
}

fn slot(replica: u32, index: u64) -> Slot {
    Slot::new(rid(replica), index)
}

fn kind(msg: &ReplicaMessage) -> &'static str {
    match msg {
        ReplicaMessage::ClientRequest(_) => "ClientRequest",
        ReplicaMessage::ClientResponse(_) => "ClientResponse",
        ReplicaMessage::PreAcceptRequest(_) => "PreAcceptRequest",
        ReplicaMessage::PreAcceptAck(_) => "PreAcceptAck",
        ReplicaMessage::PreAcceptNack(_) => "PreAcceptNack",
        ReplicaMessage::AcceptRequest(_) => "AcceptRequest",
        ReplicaMessage::AcceptAck(_) => "AcceptAck",
        ReplicaMessage::AcceptNack(_) => "AcceptNack",
        ReplicaMessage::CommitRequest(_) => "CommitRequest",
        ReplicaMessage::PrepareRequest(_) => "PrepareRequest",
        ReplicaMessage::PrepareAck(_) => "PrepareAck",
        ReplicaMessage::PrepareNack(_) => "PrepareNack",
    }
}

/// A switchboard over three replicas.  Messages queue in send order and deliver only when pumped,
/// so tests decide exactly who hears what.
struct Ensemble {
    replicas: Vec<Replica>,
    executed: Vec<Vec<(Slot, Command)>>,
    queue: VecDeque<(PeerID, PeerID, Vec<u8>)>,
    client_inbox: Vec<(PeerID, ReplicaMessage)>,
    crashed: HashSet<PeerID>,
    log: Vec<(PeerID, PeerID, &'static str)>,
}

impl Ensemble {
    fn new() -> Self {
        let ids = vec![rid(1), rid(2), rid(3)];
        let replicas = ids
            .iter()
            .map(|id| Replica::new(ReplicaOptions::default(), 0, *id, ids.clone()).unwrap())
            .collect();
        Self {
            replicas,
            executed: vec![Vec::new(), Vec::new(), Vec::new()],
            queue: VecDeque::new(),
            client_inbox: Vec::new(),
            crashed: HashSet::new(),
            log: Vec::new(),
        }
    }

    fn crash(&mut self, id: u32) {
        self.crashed.insert(pid(id));
    }

    fn replica(&self, id: u32) -> &Replica {
        &self.replicas[(id - 1) as usize]
    }

    fn executed(&self, id: u32) -> &[(Slot, Command)] {
        &self.executed[(id - 1) as usize]
    }

    fn inject(&mut self, to: u32, from: PeerID, msg: &ReplicaMessage) {
        let packet = stack_pack(msg).to_vec();
        self.deliver_packet(pid(to), from, &packet);
    }

    fn deliver_packet(&mut self, to: PeerID, from: PeerID, packet: &[u8]) {
        let idx = (to.id - 1) as usize;
        let mut env = Environment::new();
        self.replicas[idx].deliver(&mut env, from, packet);
        let executed = self.replicas[idx].execute(&mut env);
        self.executed[idx].extend(executed);
        for (dst, bytes) in env.into_messages().into_iter() {
            self.queue.push_back((to, dst, bytes));
        }
    }

    fn tick(&mut self, id: u32, times: u64) {
        let idx = (id - 1) as usize;
        for _ in 0..times {
            let mut env = Environment::new();
            self.replicas[idx].tick(&mut env);
            let executed = self.replicas[idx].execute(&mut env);
            self.executed[idx].extend(executed);
            for (dst, bytes) in env.into_messages().into_iter() {
                self.queue.push_back((pid(id), dst, bytes));
            }
        }
    }

    /// Deliver the next `n` queued packets, in order, regardless of crashes.
    fn pump_n(&mut self, n: usize) {
        for _ in 0..n {
            let Some((from, to, bytes)) = self.queue.pop_front() else {
                return;
            };
            self.route(from, to, bytes);
        }
    }

    /// Deliver everything queued, dropping traffic to or from crashed peers, until quiescent.
    fn pump(&mut self) {
        while let Some((from, to, bytes)) = self.queue.pop_front() {
            if self.crashed.contains(&from) || self.crashed.contains(&to) {
                continue;
            }
            self.route(from, to, bytes);
        }
    }

    fn drop_pending(&mut self) {
        self.queue.clear();
    }

    fn route(&mut self, from: PeerID, to: PeerID, bytes: Vec<u8>) {
        let Ok((msg, _)) = ReplicaMessage::unpack(&bytes) else {
            return;
        };
        self.log.push((from, to, kind(&msg)));
        if to.id >= 100 {
            self.client_inbox.push((to, msg));
            return;
        }
        self.deliver_packet(to, from, &bytes);
    }

    fn sent(&self, kind: &'static str) -> usize {
        self.log.iter().filter(|(_, _, k)| *k == kind).count()
    }
}

fn client_request(client: u32, command: &Command) -> ReplicaMessage {
    ReplicaMessage::ClientRequest(epaxos_pb::ClientRequest {
        client: pid(client),
        command: command.clone(),
    })
}

fn cut_of(replica: &Replica) -> HashMap<ReplicaID, i64> {
    replica.store().executed_cut().clone()
}

////////////////////////////////////////////// scenarios ///////////////////////////////////////////

#[test]
fn fast_path_no_conflict() {
    let mut ensemble = Ensemble::new();
    let x = Command::op(b"1", b"x");
    ensemble.inject(1, pid(100), &client_request(100, &x));
    ensemble.pump();
    for id in [1, 2, 3] {
        assert_eq!(vec![(slot(1, 0), x.clone())], ensemble.executed(id).to_vec());
        let inst = ensemble.replica(id).store().get(slot(1, 0)).unwrap();
        assert_eq!(Status::Executed, inst.status());
        assert_eq!(1, inst.seq());
        assert!(inst.deps().is_empty());
        let mut expected = HashMap::new();
        expected.insert(rid(1), 0);
        expected.insert(rid(2), -1);
        expected.insert(rid(3), -1);
        assert_eq!(expected, cut_of(ensemble.replica(id)));
    }
    // The fast path skipped the accept phase entirely.
    assert_eq!(0, ensemble.sent("AcceptRequest"));
    assert_eq!(1, ensemble.client_inbox.len());
    let (to, msg) = &ensemble.client_inbox[0];
    assert_eq!(pid(100), *to);
    assert!(matches!(msg, ReplicaMessage::ClientResponse(resp) if resp.command == x));
}

#[test]
fn slow_path_unions_dependencies() {
    let mut ensemble = Ensemble::new();
    let x = Command::op(b"1", b"x");
    let y = Command::op(b"1", b"y");
    ensemble.inject(1, pid(100), &client_request(100, &x));
    ensemble.inject(2, pid(101), &client_request(101, &y));
    ensemble.pump();
    // Interfering proposals crossed, so at least one leader saw disagreement and went slow.
    assert!(ensemble.sent("AcceptRequest") > 0);
    let expected = vec![(slot(1, 0), x.clone()), (slot(2, 0), y.clone())];
    for id in [1, 2, 3] {
        assert_eq!(expected, ensemble.executed(id).to_vec());
        let store = ensemble.replica(id).store();
        let xi = store.get(slot(1, 0)).unwrap();
        let yi = store.get(slot(2, 0)).unwrap();
        // Interfering committed instances must be dependency-related.
        assert!(xi.deps().contains(&slot(2, 0)) || yi.deps().contains(&slot(1, 0)));
    }
    assert_eq!(2, ensemble.client_inbox.len());
}

#[test]
fn recovery_reproposes_surviving_pre_accept() {
    let mut ensemble = Ensemble::new();
    let x = Command::op(b"1", b"x");
    ensemble.inject(1, pid(100), &client_request(100, &x));
    // B hears the pre-accept; its ack, and C's copy, die with A.
    ensemble.pump_n(1);
    ensemble.drop_pending();
    ensemble.crash(1);
    ensemble.tick(2, JIFFIES + 1);
    ensemble.pump();
    for id in [2, 3] {
        assert_eq!(vec![(slot(1, 0), x.clone())], ensemble.executed(id).to_vec());
        let inst = ensemble.replica(id).store().get(slot(1, 0)).unwrap();
        assert_eq!(Status::Executed, inst.status());
        assert_eq!(Some(&x), inst.command());
    }
    assert!(ensemble.sent("PrepareRequest") > 0);
    // One surviving pre-accept is one short of half the ensemble, so the recoverer must replay
    // the full protocol rather than finish the slow path off the prepare round:  a second
    // PreAcceptRequest round follows the PrepareRequest, and the first AcceptRequest only
    // follows that replay.
    assert_eq!(2, ensemble.sent("PreAcceptRequest"));
    let prepare_at = ensemble
        .log
        .iter()
        .position(|(_, _, k)| *k == "PrepareRequest")
        .unwrap();
    let replay_at = prepare_at
        + ensemble.log[prepare_at..]
            .iter()
            .position(|(_, _, k)| *k == "PreAcceptRequest")
            .unwrap();
    let accept_at = ensemble
        .log
        .iter()
        .position(|(_, _, k)| *k == "AcceptRequest")
        .unwrap();
    assert!(accept_at > replay_at);
}

#[test]
fn recovery_fills_lost_slot_with_nop() {
    let mut ensemble = Ensemble::new();
    // A pre-accepted something at (A,0) that no peer ever saw, then led (A,1) whose deps name
    // (A,0).  B learns of (A,0) only as a dependency.
    let w = Command::op(b"2", b"w");
    let pre_accept = ReplicaMessage::PreAcceptRequest(PreAcceptRequest {
        slot: slot(1, 1),
        ballot: Ballot::initial(0, rid(1)),
        command: w.clone(),
        seq: 1,
        deps: vec![slot(1, 0)],
    });
    ensemble.inject(2, pid(1), &pre_accept);
    ensemble.drop_pending();
    ensemble.crash(1);
    ensemble.tick(2, JIFFIES + 1);
    ensemble.pump();
    for id in [2, 3] {
        let store = ensemble.replica(id).store();
        let ghost = store.get(slot(1, 0)).unwrap();
        assert_eq!(Status::Executed, ghost.status());
        assert_eq!(Some(&Command::Nop), ghost.command());
        // The no-op reaches no application.
        assert!(!ensemble
            .executed(id)
            .iter()
            .any(|(s, _)| *s == slot(1, 0)));
        // The cut moves past both of the dead leader's slots.
        assert_eq!(1, cut_of(ensemble.replica(id))[&rid(1)]);
        assert_eq!(2, store.iter_status(Status::Executed).count());
        assert!(ensemble.executed(id).iter().any(|(s, c)| *s == slot(1, 1) && *c == w));
    }
}

#[test]
fn ballot_supersession_backs_one_recoverer_off() {
    let mut ensemble = Ensemble::new();
    let x = Command::op(b"1", b"x");
    ensemble.inject(1, pid(100), &client_request(100, &x));
    // Both peers pre-accept, then the leader dies before hearing back.
    ensemble.pump_n(2);
    ensemble.drop_pending();
    ensemble.crash(1);
    // Both survivors time out and race to recover the same slot.
    ensemble.tick(2, JIFFIES + 1);
    ensemble.tick(3, JIFFIES + 1);
    ensemble.pump();
    // C's ballot (0,1,C) beats B's (0,1,B); B was told no.
    assert!(ensemble
        .log
        .iter()
        .any(|(from, to, k)| *from == pid(3) && *to == pid(2) && *k == "PrepareNack"));
    for id in [2, 3] {
        assert_eq!(vec![(slot(1, 0), x.clone())], ensemble.executed(id).to_vec());
        // Commit cleared every deadline; the loser does not keep retrying.
        assert_eq!(None, ensemble.replica(id).minimum_wait());
    }
}

#[test]
fn commit_is_idempotent() {
    let mut ensemble = Ensemble::new();
    let x = Command::op(b"1", b"x");
    let commit = ReplicaMessage::CommitRequest(CommitRequest {
        slot: slot(1, 0),
        ballot: Ballot::initial(0, rid(1)),
        seq: 1,
        command: x.clone(),
        deps: Vec::new(),
    });
    for _ in 0..3 {
        ensemble.inject(2, pid(1), &commit);
    }
    assert_eq!(vec![(slot(1, 0), x)], ensemble.executed(2).to_vec());
    assert_eq!(
        Status::Executed,
        ensemble.replica(2).store().get(slot(1, 0)).unwrap().status()
    );
}

#[test]
fn prepare_raises_exactly_once() {
    let ids = vec![rid(1), rid(2), rid(3)];
    let mut replica = Replica::new(ReplicaOptions::default(), 0, rid(2), ids).unwrap();
    let prepare = ReplicaMessage::PrepareRequest(PrepareRequest {
        slot: slot(1, 0),
        ballot: Ballot {
            epoch: 0,
            number: 5,
            leader: rid(3),
        },
    });
    let packet = stack_pack(&prepare).to_vec();
    let mut env = Environment::new();
    replica.deliver(&mut env, pid(3), &packet);
    let replies: Vec<&'static str> = env
        .messages()
        .iter()
        .map(|(_, bytes)| kind(&ReplicaMessage::unpack(bytes).unwrap().0))
        .collect();
    assert_eq!(vec!["PrepareAck"], replies);
    // Re-delivery at the same ballot is refused and the ballot stays put.
    let mut env = Environment::new();
    replica.deliver(&mut env, pid(3), &packet);
    let replies: Vec<&'static str> = env
        .messages()
        .iter()
        .map(|(_, bytes)| kind(&ReplicaMessage::unpack(bytes).unwrap().0))
        .collect();
    assert_eq!(vec!["PrepareNack"], replies);
    let expected = Ballot {
        epoch: 0,
        number: 5,
        leader: rid(3),
    };
    assert_eq!(expected, replica.store().get(slot(1, 0)).unwrap().ballot());
}
