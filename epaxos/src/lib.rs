#![doc = include_str!("../README.md")]

pub mod deps;
pub mod instance;
pub mod sim;
pub mod timeout;

mod acceptor;
mod executor;
mod leader;
mod replica;
mod state;

pub use executor::Executor;
pub use replica::{Environment, Replica};
pub use state::{ReplicaOptions, ReplicaState};

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Registers this crate's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    acceptor::register_biometrics(collector);
    executor::register_biometrics(collector);
    instance::register_biometrics(collector);
    leader::register_biometrics(collector);
    replica::register_biometrics(collector);
}
