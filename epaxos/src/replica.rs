use std::collections::HashMap;

use biometrics::Counter;

use buffertk::{stack_pack, Unpacker};

use indicio::{clue, ERROR};

use epaxos_pb::{
    ClientResponse, Command, Error, PeerID, ReplicaID, ReplicaMessage, Slot,
};

use crate::executor::Executor;
use crate::instance::InstanceStore;
use crate::leader::Driver;
use crate::state::{ReplicaOptions, ReplicaState};
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MESSAGES: Counter = Counter::new("epaxos.replica.messages");
static SENDS: Counter = Counter::new("epaxos.replica.sends");
static TICKS: Counter = Counter::new("epaxos.replica.ticks");
static DECODE_FAILURE: Counter = Counter::new("epaxos.replica.decode_failure");

pub(crate) fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&MESSAGES);
    collector.register_counter(&SENDS);
    collector.register_counter(&TICKS);
    collector.register_counter(&DECODE_FAILURE);
}

//////////////////////////////////////////// Environment ///////////////////////////////////////////

/// Collects the packets a replica wants sent.  Packing happens here so every caller, the
/// simulator and tests included, exercises the wire format.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    messages: Vec<(PeerID, Vec<u8>)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: PeerID, msg: &ReplicaMessage) {
        SENDS.click();
        self.messages.push((to, stack_pack(msg).to_vec()));
    }

    pub fn messages(&self) -> &[(PeerID, Vec<u8>)] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<(PeerID, Vec<u8>)> {
        self.messages
    }
}

////////////////////////////////////////////// Replica /////////////////////////////////////////////

/// One replica of the ensemble.  The replica is a single-threaded state machine:  feed it packets
/// with [deliver], advance its clock with [tick], and drain execution with [execute]; outbound
/// packets accumulate in the [Environment] handed to each call.
///
/// [deliver]: Replica::deliver
/// [tick]: Replica::tick
/// [execute]: Replica::execute
pub struct Replica {
    pub(crate) state: ReplicaState,
    pub(crate) store: InstanceStore,
    pub(crate) executor: Executor,
    pub(crate) drivers: HashMap<Slot, Driver>,
    pub(crate) clients: HashMap<Slot, PeerID>,
    pub(crate) backoff: HashMap<Slot, u64>,
}

impl Replica {
    pub fn new(
        options: ReplicaOptions,
        epoch: u32,
        id: ReplicaID,
        replicas: Vec<ReplicaID>,
    ) -> Result<Self, Error> {
        let jiffies = options.jiffies_per_timeout;
        let state = ReplicaState::new(options, epoch, id, replicas)?;
        let store = InstanceStore::new(state.replicas(), jiffies);
        Ok(Self {
            state,
            store,
            executor: Executor::new(),
            drivers: HashMap::new(),
            clients: HashMap::new(),
            backoff: HashMap::new(),
        })
    }

    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// Decode one packet from `from` and dispatch it to its handler.  Undecodable packets drop;
    /// the sender's retry replaces them.
    pub fn deliver(&mut self, env: &mut Environment, from: PeerID, packet: &[u8]) {
        MESSAGES.click();
        let mut up = Unpacker::new(packet);
        let msg: ReplicaMessage = match up.unpack() {
            Ok(msg) => msg,
            Err(err) => {
                DECODE_FAILURE.click();
                clue!(COLLECTOR, ERROR, {
                    decode_failure: {
                        from: format!("{}", from),
                        error: format!("{:?}", err),
                    },
                });
                return;
            }
        };
        match msg {
            ReplicaMessage::ClientRequest(m) => self.on_client_request(env, m),
            ReplicaMessage::ClientResponse(_) => {}
            ReplicaMessage::PreAcceptRequest(m) => self.on_pre_accept_request(env, from, m),
            ReplicaMessage::PreAcceptAck(m) => self.on_pre_accept_ack(env, from.into(), m),
            ReplicaMessage::PreAcceptNack(m) => self.on_pre_accept_nack(env, m),
            ReplicaMessage::AcceptRequest(m) => self.on_accept_request(env, from, m),
            ReplicaMessage::AcceptAck(m) => self.on_accept_ack(env, from.into(), m),
            ReplicaMessage::AcceptNack(m) => self.on_accept_nack(env, m),
            ReplicaMessage::CommitRequest(m) => self.on_commit_request(env, m),
            ReplicaMessage::PrepareRequest(m) => self.on_prepare_request(env, from, m),
            ReplicaMessage::PrepareAck(m) => self.on_prepare_ack(env, from.into(), m),
            ReplicaMessage::PrepareNack(m) => self.on_prepare_nack(env, m),
        }
    }

    /// Advance the logical clock one tick and dispatch recovery for every expired deadline.
    pub fn tick(&mut self, env: &mut Environment) {
        TICKS.click();
        let now = self.state.tick();
        for slot in self.store.expired(now) {
            self.begin_recovery(env, slot);
        }
    }

    /// Execute every committed instance whose dependencies allow it.  Returns the application
    /// stream, with no-ops withheld; waiting clients are answered here, at execution time.
    pub fn execute(&mut self, env: &mut Environment) -> Vec<(Slot, Command)> {
        let executed = self.executor.drain(&mut self.store);
        let mut out = Vec::with_capacity(executed.len());
        for (slot, command) in executed.into_iter() {
            if let Some(driver) = self.drivers.get_mut(&slot) {
                *driver = Driver::Done;
            }
            self.backoff.remove(&slot);
            if let Some(client) = self.clients.remove(&slot) {
                env.send(
                    client,
                    &ReplicaMessage::ClientResponse(ClientResponse {
                        client,
                        command: command.clone(),
                    }),
                );
            }
            if !command.is_nop() {
                out.push((slot, command));
            }
        }
        out
    }

    /// Ticks until the next armed deadline, for the poll loop.  None when nothing is armed.
    pub fn minimum_wait(&self) -> Option<u64> {
        self.store.minimum_wait(self.state.ticks())
    }
}
