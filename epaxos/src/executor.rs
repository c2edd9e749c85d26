use std::collections::{BTreeSet, HashMap, HashSet};

use biometrics::Counter;

use epaxos_pb::{Command, Slot, Status};

use crate::instance::InstanceStore;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static EXECUTED: Counter = Counter::new("epaxos.executor.executed");
static EXECUTED_NOP: Counter = Counter::new("epaxos.executor.nop");
static BLOCKED: Counter = Counter::new("epaxos.executor.blocked");

pub(crate) fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&EXECUTED);
    collector.register_counter(&EXECUTED_NOP);
    collector.register_counter(&BLOCKED);
}

///////////////////////////////////////////// Executor /////////////////////////////////////////////

/// Turns the committed dependency graph into a linear execution sequence.  Committed instances
/// queue here until every instance reachable through their dependencies is committed too; then
/// whole strongly connected components execute at once, dependencies first, members ordered by
/// (seq, leader, index) so every replica agrees.
#[derive(Debug, Default)]
pub struct Executor {
    pending: BTreeSet<Slot>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, slot: Slot) {
        self.pending.insert(slot);
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Execute every pending instance whose dependency closure is fully committed.  Returns the
    /// executed (slot, command) sequence, no-ops included; instances that hit an uncommitted
    /// dependency stay pending without error.
    pub fn drain(&mut self, store: &mut InstanceStore) -> Vec<(Slot, Command)> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let mut tarjan = Tarjan {
            store,
            counter: 0,
            index: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            components: Vec::new(),
            tainted: HashSet::new(),
        };
        for slot in self.pending.iter().copied() {
            if !tarjan.index.contains_key(&slot) {
                tarjan.strongconnect(slot);
            }
        }
        let Tarjan {
            components, tainted, ..
        } = tarjan;
        // Components complete dependencies-first, so one forward pass propagates blockage.
        let mut component_of: HashMap<Slot, usize> = HashMap::new();
        let mut blocked: HashSet<usize> = HashSet::new();
        let mut out = Vec::new();
        for (number, mut component) in components.into_iter().enumerate() {
            let mut is_blocked = component.iter().any(|slot| tainted.contains(slot));
            if !is_blocked {
                'members: for slot in component.iter() {
                    for dep in store.get(*slot).expect("pending instance").deps() {
                        if let Some(c) = component_of.get(dep) {
                            if blocked.contains(c) {
                                is_blocked = true;
                                break 'members;
                            }
                        }
                    }
                }
            }
            for slot in component.iter() {
                component_of.insert(*slot, number);
            }
            if is_blocked {
                BLOCKED.click();
                blocked.insert(number);
                continue;
            }
            component.sort_by_key(|slot| {
                (
                    store.get(*slot).expect("pending instance").seq(),
                    slot.replica,
                    slot.index,
                )
            });
            for slot in component.into_iter() {
                let command = store
                    .get(slot)
                    .and_then(|inst| inst.command().cloned())
                    .unwrap_or_default();
                store.mark_executed(slot);
                self.pending.remove(&slot);
                EXECUTED.click();
                if command.is_nop() {
                    EXECUTED_NOP.click();
                }
                out.push((slot, command));
            }
        }
        out
    }
}

////////////////////////////////////////////// Tarjan //////////////////////////////////////////////

struct Tarjan<'a> {
    store: &'a InstanceStore,
    counter: usize,
    index: HashMap<Slot, usize>,
    lowlink: HashMap<Slot, usize>,
    on_stack: HashSet<Slot>,
    stack: Vec<Slot>,
    components: Vec<Vec<Slot>>,
    tainted: HashSet<Slot>,
}

impl Tarjan<'_> {
    fn strongconnect(&mut self, v: Slot) {
        self.index.insert(v, self.counter);
        self.lowlink.insert(v, self.counter);
        self.counter += 1;
        self.stack.push(v);
        self.on_stack.insert(v);
        let deps: Vec<Slot> = self
            .store
            .get(v)
            .map(|inst| inst.deps().iter().copied().collect())
            .unwrap_or_default();
        for w in deps {
            let status = self
                .store
                .get(w)
                .map(|inst| inst.status())
                .unwrap_or(Status::Prepared);
            if status == Status::Executed {
                continue;
            }
            if status < Status::Committed {
                self.tainted.insert(v);
                continue;
            }
            if !self.index.contains_key(&w) {
                self.strongconnect(w);
                let low = std::cmp::min(self.lowlink[&v], self.lowlink[&w]);
                self.lowlink.insert(v, low);
            } else if self.on_stack.contains(&w) {
                let low = std::cmp::min(self.lowlink[&v], self.index[&w]);
                self.lowlink.insert(v, low);
            }
        }
        if self.lowlink[&v] == self.index[&v] {
            let mut component = Vec::new();
            loop {
                let w = self.stack.pop().expect("tarjan stack");
                self.on_stack.remove(&w);
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
