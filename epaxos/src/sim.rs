//! A deterministic discrete-event simulator for whole ensembles.  Time is virtual microseconds;
//! every source of randomness is a seeded guacamole, so a run is a pure function of its seed.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use buffertk::{stack_pack, Unpackable};

use guacamole::combinators::*;
use guacamole::Guacamole;

use epaxos_pb::{ClientRequest, Command, PeerID, ReplicaMessage, Slot};

use crate::replica::{Environment, Replica};

pub const MILLIS: u64 = 1_000;
pub const SECONDS: u64 = 1_000_000;

/////////////////////////////////////////////// Event //////////////////////////////////////////////

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Event {
    WatchDog {
        who: PeerID,
    },
    Deliver {
        from: PeerID,
        to: PeerID,
        what: Vec<u8>,
    },
}

//////////////////////////////////////////// EventState ////////////////////////////////////////////

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct EventState {
    when: u64,
    what: Event,
}

///////////////////////////////////////////// EventHeap ////////////////////////////////////////////

#[derive(Debug, Default)]
struct EventHeap {
    clock: u64,
    events: BinaryHeap<Reverse<EventState>>,
}

impl EventHeap {
    fn push(&mut self, what: Event, how_far_in_the_future: u64) {
        let when = self.clock + how_far_in_the_future;
        self.events.push(Reverse(EventState { when, what }));
    }

    fn peek_when(&self) -> Option<u64> {
        self.events.peek().map(|Reverse(ev)| ev.when)
    }

    fn pop(&mut self) -> Option<Event> {
        let Reverse(ev) = self.events.pop()?;
        self.clock = ev.when;
        Some(ev.what)
    }
}

////////////////////////////////////////////// Context /////////////////////////////////////////////

/// What a process may do when scheduled:  send packets and ask to be woken later.
#[derive(Clone, Debug, Default)]
pub struct Context {
    watch_dog: Option<u64>,
    packets: Vec<(PeerID, Vec<u8>)>,
}

impl Context {
    pub fn set_watch_dog(&mut self, micros: u64) {
        self.watch_dog = Some(micros);
    }

    pub fn send_packet(&mut self, to: PeerID, what: Vec<u8>) {
        self.packets.push((to, what));
    }
}

////////////////////////////////////////////// Process /////////////////////////////////////////////

pub trait Process {
    fn pid(&self) -> PeerID;
    fn watch_dog(&mut self, ctx: &mut Context);
    fn deliver(&mut self, ctx: &mut Context, from: PeerID, what: &[u8]);
}

/////////////////////////////////////////// LinkOptions ////////////////////////////////////////////

/// The fault model for every link.  Defaults deliver everything with half a millisecond of
/// jittered latency.
#[derive(Clone, Debug)]
pub struct LinkOptions {
    pub latency_micros: u64,
    pub jitter_micros: u64,
    pub drop_probability: f32,
    pub duplicate_probability: f32,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            latency_micros: 500,
            jitter_micros: 500,
            drop_probability: 0.0,
            duplicate_probability: 0.0,
        }
    }
}

///////////////////////////////////////////// Simulator ////////////////////////////////////////////

pub struct Simulator {
    events: EventHeap,
    processes: Vec<Rc<RefCell<dyn Process>>>,
    links: LinkOptions,
    partitions: HashSet<(PeerID, PeerID)>,
    // Per-link high-water mark; delivery never reorders within a link.
    fifo: HashMap<(PeerID, PeerID), u64>,
    guac: Guacamole,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        Self::with_links(seed, LinkOptions::default())
    }

    pub fn with_links(seed: u64, links: LinkOptions) -> Self {
        Self {
            events: EventHeap::default(),
            processes: Vec::new(),
            links,
            partitions: HashSet::new(),
            fifo: HashMap::new(),
            guac: Guacamole::new(seed),
        }
    }

    /// Register a process and schedule its first watch dog immediately.  The returned handle
    /// stays valid for the life of the simulator and is how tests inspect state.
    pub fn add_process<P: Process + 'static>(&mut self, proc: P) -> Rc<RefCell<P>> {
        self.events.push(Event::WatchDog { who: proc.pid() }, 0);
        let proc = Rc::new(RefCell::new(proc));
        self.processes.push(Rc::clone(&proc) as Rc<RefCell<dyn Process>>);
        proc
    }

    /// Cut the link between `a` and `b`, both directions.  Packets in flight still deliver.
    pub fn partition(&mut self, a: PeerID, b: PeerID) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    pub fn heal(&mut self, a: PeerID, b: PeerID) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    /// Isolate `who` from every other process.
    pub fn crash(&mut self, who: PeerID) {
        for proc in self.processes.iter() {
            let other = proc.borrow().pid();
            if other != who {
                self.partitions.insert((who, other));
                self.partitions.insert((other, who));
            }
        }
    }

    pub fn now(&self) -> u64 {
        self.events.clock
    }

    /// Run events until the virtual clock passes `deadline` micros or nothing remains scheduled.
    pub fn run_until(&mut self, deadline: u64) {
        loop {
            match self.events.peek_when() {
                Some(when) if when <= deadline => {}
                _ => break,
            }
            match self.events.pop().expect("peeked event") {
                Event::WatchDog { who } => self.watch_dog(who),
                Event::Deliver { from, to, what } => self.deliver(from, to, what),
            }
        }
    }

    fn watch_dog(&mut self, who: PeerID) {
        let Some(proc) = self.get_process(who) else {
            return;
        };
        let proc: &mut dyn Process = &mut *proc.borrow_mut();
        let mut ctx = Context::default();
        proc.watch_dog(&mut ctx);
        self.integrate(who, ctx);
    }

    fn deliver(&mut self, from: PeerID, to: PeerID, what: Vec<u8>) {
        let Some(proc) = self.get_process(to) else {
            return;
        };
        let proc: &mut dyn Process = &mut *proc.borrow_mut();
        let mut ctx = Context::default();
        proc.deliver(&mut ctx, from, &what);
        self.integrate(to, ctx);
    }

    fn get_process(&self, who: PeerID) -> Option<Rc<RefCell<dyn Process>>> {
        self.processes
            .iter()
            .find(|p| p.borrow().pid() == who)
            .map(Rc::clone)
    }

    fn integrate(&mut self, from: PeerID, ctx: Context) {
        if let Some(micros) = ctx.watch_dog {
            self.events.push(Event::WatchDog { who: from }, micros);
        }
        for (to, what) in ctx.packets.into_iter() {
            if self.partitions.contains(&(from, to)) {
                continue;
            }
            if self.links.drop_probability > 0.0 && prob(self.links.drop_probability)(&mut self.guac)
            {
                continue;
            }
            let duplicate = self.links.duplicate_probability > 0.0
                && prob(self.links.duplicate_probability)(&mut self.guac);
            if duplicate {
                self.schedule(from, to, what.clone());
            }
            self.schedule(from, to, what);
        }
    }

    fn schedule(&mut self, from: PeerID, to: PeerID, what: Vec<u8>) {
        let latency = self.latency();
        let when = std::cmp::max(self.events.clock + latency, self.fifo_floor(from, to) + 1);
        self.fifo.insert((from, to), when);
        self.events
            .push(Event::Deliver { from, to, what }, when - self.events.clock);
    }

    fn fifo_floor(&self, from: PeerID, to: PeerID) -> u64 {
        self.fifo.get(&(from, to)).copied().unwrap_or(0)
    }

    fn latency(&mut self) -> u64 {
        let jitter: u64 = if self.links.jitter_micros > 0 {
            any::<u64>(&mut self.guac) % self.links.jitter_micros
        } else {
            0
        };
        std::cmp::max(1, self.links.latency_micros + jitter)
    }
}

////////////////////////////////////////// ReplicaProcess //////////////////////////////////////////

/// Adapts a [Replica] to the simulator:  one watch dog per tick, packets forwarded both ways,
/// and the executed application stream retained for inspection.
pub struct ReplicaProcess {
    replica: Replica,
    tick_micros: u64,
    executed: Vec<(Slot, Command)>,
}

impl ReplicaProcess {
    pub fn new(replica: Replica) -> Self {
        let tick_micros = replica.state().options().milliseconds_per_tick * MILLIS;
        Self {
            replica,
            tick_micros,
            executed: Vec::new(),
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn executed(&self) -> &[(Slot, Command)] {
        &self.executed
    }

    fn integrate(&mut self, ctx: &mut Context, env: Environment) {
        for (to, what) in env.into_messages().into_iter() {
            ctx.send_packet(to, what);
        }
    }
}

impl Process for ReplicaProcess {
    fn pid(&self) -> PeerID {
        PeerID::from(self.replica.state().id())
    }

    fn watch_dog(&mut self, ctx: &mut Context) {
        ctx.set_watch_dog(self.tick_micros);
        let mut env = Environment::new();
        self.replica.tick(&mut env);
        self.executed.extend(self.replica.execute(&mut env));
        self.integrate(ctx, env);
    }

    fn deliver(&mut self, ctx: &mut Context, from: PeerID, what: &[u8]) {
        let mut env = Environment::new();
        self.replica.deliver(&mut env, from, what);
        self.executed.extend(self.replica.execute(&mut env));
        self.integrate(ctx, env);
    }
}

/////////////////////////////////////////// ClientProcess //////////////////////////////////////////

/// Issues a workload of commands against one replica, one at a time, retrying on silence.  Goes
/// quiet when the workload is exhausted.  The retry interval sits above the worst-case recovery
/// latency so a slow commit is not mistaken for a lost request.
pub struct ClientProcess {
    id: PeerID,
    target: PeerID,
    workload: VecDeque<Command>,
    inflight: Option<Command>,
    responses: Vec<Command>,
    retry_micros: u64,
}

impl ClientProcess {
    pub fn new(id: PeerID, target: PeerID, workload: Vec<Command>) -> Self {
        Self {
            id,
            target,
            workload: workload.into(),
            inflight: None,
            responses: Vec::new(),
            retry_micros: 5 * SECONDS,
        }
    }

    pub fn done(&self) -> bool {
        self.inflight.is_none() && self.workload.is_empty()
    }

    pub fn responses(&self) -> &[Command] {
        &self.responses
    }
}

impl Process for ClientProcess {
    fn pid(&self) -> PeerID {
        self.id
    }

    fn watch_dog(&mut self, ctx: &mut Context) {
        if self.inflight.is_none() {
            self.inflight = self.workload.pop_front();
        }
        let Some(command) = self.inflight.clone() else {
            return;
        };
        let msg = ReplicaMessage::ClientRequest(ClientRequest {
            client: self.id,
            command,
        });
        ctx.send_packet(self.target, stack_pack(&msg).to_vec());
        ctx.set_watch_dog(self.retry_micros);
    }

    fn deliver(&mut self, ctx: &mut Context, _: PeerID, what: &[u8]) {
        let Ok((msg, _)) = ReplicaMessage::unpack(what) else {
            return;
        };
        let ReplicaMessage::ClientResponse(resp) = msg else {
            return;
        };
        if self.inflight.as_ref() == Some(&resp.command) {
            self.responses.push(resp.command);
            self.inflight = None;
            if !self.workload.is_empty() {
                ctx.set_watch_dog(1);
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
