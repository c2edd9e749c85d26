use arrrg::CommandLine;

use guacamole::combinators::*;
use guacamole::Guacamole;

use epaxos_pb::{Command, PeerID, ReplicaID};

use epaxos::sim::{ClientProcess, Process, ReplicaProcess, Simulator, SECONDS};
use epaxos::{Replica, ReplicaOptions};

/////////////////////////////////////////////// Options ////////////////////////////////////////////

#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(optional, "Number of replicas in the ensemble.")]
    replicas: u64,
    #[arrrg(optional, "Number of concurrent clients.")]
    clients: u64,
    #[arrrg(optional, "Commands each client issues.")]
    commands: u64,
    #[arrrg(optional, "Distinct keys across the workload.")]
    keys: u64,
    #[arrrg(optional, "Virtual seconds to simulate.")]
    seconds: u64,
    #[arrrg(optional, "Guacamole seed for the network and the workload.")]
    seed: u64,
    #[arrrg(flag, "Emit clues to stderr.")]
    verbose: bool,
    #[arrrg(nested)]
    replica: ReplicaOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            replicas: 3,
            clients: 2,
            commands: 32,
            keys: 4,
            seconds: 60,
            seed: 0,
            verbose: false,
            replica: ReplicaOptions::default(),
        }
    }
}

//////////////////////////////////////////////// main //////////////////////////////////////////////

fn main() {
    let (options, free) =
        Options::from_command_line("Usage: epaxos-sim [OPTIONS]");
    if !free.is_empty() {
        eprintln!("command takes no positional arguments");
        std::process::exit(1);
    }
    if options.keys == 0 {
        eprintln!("workload needs at least one key");
        std::process::exit(1);
    }
    if options.verbose {
        let emitter = std::sync::Arc::new(indicio::stdio::StdioEmitter);
        epaxos::COLLECTOR.register(emitter);
        epaxos::COLLECTOR.set_verbosity(indicio::INFO);
    }
    let ids: Vec<ReplicaID> = (1..=options.replicas as u32).map(ReplicaID::new).collect();
    let mut sim = Simulator::new(options.seed);
    let mut replicas = Vec::new();
    for id in ids.iter() {
        let replica = match Replica::new(options.replica.clone(), 0, *id, ids.clone()) {
            Ok(replica) => replica,
            Err(err) => {
                eprintln!("could not instantiate replica: {}", err);
                std::process::exit(1);
            }
        };
        replicas.push(sim.add_process(ReplicaProcess::new(replica)));
    }
    let mut workload = Guacamole::new(options.seed);
    let mut clients = Vec::new();
    for number in 0..options.clients {
        let commands: Vec<Command> = (0..options.commands)
            .map(|_| {
                let key = any::<u64>(&mut workload) % options.keys;
                let payload: u64 = any(&mut workload);
                Command::op(
                    key.to_be_bytes().as_slice(),
                    payload.to_be_bytes().as_slice(),
                )
            })
            .collect();
        let id = PeerID::new(100 + number as u32);
        let target = PeerID::new(1 + (number % options.replicas) as u32);
        clients.push(sim.add_process(ClientProcess::new(id, target, commands)));
    }
    sim.run_until(options.seconds * SECONDS);
    for client in clients.iter() {
        let client = client.borrow();
        println!(
            "{}: {} responses{}",
            client.pid(),
            client.responses().len(),
            if client.done() { "" } else { " (incomplete)" },
        );
    }
    for replica in replicas.iter() {
        let replica = replica.borrow();
        let state = replica.replica().state();
        let store = replica.replica().store();
        let mut cut: Vec<_> = store.executed_cut().iter().collect();
        cut.sort();
        println!(
            "{}: executed={} cut={:?} statuses={:?}",
            state.id(),
            replica.executed().len(),
            cut,
            store.status_counts(),
        );
    }
}
