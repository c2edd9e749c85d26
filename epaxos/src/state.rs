use guacamole::combinators::any;
use guacamole::Guacamole;

use zerror_core::ErrorCore;

use epaxos_pb::{Ballot, Error, ReplicaID, Slot};

/////////////////////////////////////////// ReplicaOptions /////////////////////////////////////////

/// Tuning knobs for one replica.  Defaults suit a LAN ensemble; quorum sizes of zero derive the
/// standard values from the ensemble size.
#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
pub struct ReplicaOptions {
    #[arrrg(optional, "Milliseconds of wall-clock per logical tick.")]
    pub milliseconds_per_tick: u64,
    #[arrrg(optional, "Ticks before an uncommitted instance is recovered.")]
    pub jiffies_per_timeout: u64,
    #[arrrg(flag, "Disable the PreAccept fast path.")]
    pub disable_fast_path: bool,
    #[arrrg(optional, "Slow-path quorum size, counting the leader; 0 derives a majority.")]
    pub quorum_full: u64,
    #[arrrg(optional, "Fast-path quorum size, counting peers only; 0 derives the EPaxos value.")]
    pub quorum_fast: u64,
    #[arrrg(optional, "Guacamole seed for recovery backoff jitter.")]
    pub seed: u64,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            milliseconds_per_tick: 50,
            jiffies_per_timeout: 20,
            disable_fast_path: false,
            quorum_full: 0,
            quorum_fast: 0,
            seed: 0,
        }
    }
}

//////////////////////////////////////////// ReplicaState //////////////////////////////////////////

/// Local identity, membership, quorum configuration, and the logical clock.  The identity and
/// epoch are immutable after construction; everything mutable lives behind `&mut self`.
pub struct ReplicaState {
    options: ReplicaOptions,
    epoch: u32,
    id: ReplicaID,
    replicas: Vec<ReplicaID>,
    ticks: u64,
    next_index: u64,
    quorum_full: usize,
    quorum_fast: usize,
    jitter: Guacamole,
}

impl ReplicaState {
    pub fn new(
        options: ReplicaOptions,
        epoch: u32,
        id: ReplicaID,
        mut replicas: Vec<ReplicaID>,
    ) -> Result<Self, Error> {
        replicas.sort();
        for pair in replicas.windows(2) {
            if pair[0] == pair[1] {
                return Err(Error::InvalidConfiguration {
                    core: ErrorCore::default(),
                    what: format!("duplicate replica {}", pair[0]),
                });
            }
        }
        if replicas.len() < 3 {
            return Err(Error::InvalidConfiguration {
                core: ErrorCore::default(),
                what: format!("ensemble of {} cannot tolerate a failure", replicas.len()),
            });
        }
        if !replicas.contains(&id) {
            return Err(Error::InvalidConfiguration {
                core: ErrorCore::default(),
                what: format!("{} is not a member of the ensemble", id),
            });
        }
        if options.jiffies_per_timeout == 0 {
            return Err(Error::InvalidConfiguration {
                core: ErrorCore::default(),
                what: "jiffies_per_timeout must be positive".to_string(),
            });
        }
        let n = replicas.len();
        let f = (n - 1) / 2;
        let quorum_full = if options.quorum_full == 0 {
            f + 1
        } else {
            options.quorum_full as usize
        };
        if quorum_full < f + 1 || quorum_full > n {
            return Err(Error::InvalidConfiguration {
                core: ErrorCore::default(),
                what: format!("quorum_full {} outside [{}, {}]", quorum_full, f + 1, n),
            });
        }
        let quorum_fast = if options.quorum_fast == 0 {
            f + (f + 1) / 2
        } else {
            options.quorum_fast as usize
        };
        if quorum_fast < quorum_full - 1 || quorum_fast > n - 1 {
            return Err(Error::InvalidConfiguration {
                core: ErrorCore::default(),
                what: format!(
                    "quorum_fast {} outside [{}, {}]",
                    quorum_fast,
                    quorum_full - 1,
                    n - 1
                ),
            });
        }
        let jitter = Guacamole::new(options.seed.wrapping_add(id.id as u64));
        Ok(Self {
            options,
            epoch,
            id,
            replicas,
            ticks: 0,
            next_index: 0,
            quorum_full,
            quorum_fast,
            jitter,
        })
    }

    pub fn options(&self) -> &ReplicaOptions {
        &self.options
    }

    pub fn id(&self) -> ReplicaID {
        self.id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn replicas(&self) -> &[ReplicaID] {
        &self.replicas
    }

    pub fn peers(&self) -> impl Iterator<Item = ReplicaID> + '_ {
        let id = self.id;
        self.replicas.iter().copied().filter(move |r| *r != id)
    }

    pub fn is_replica(&self, replica: ReplicaID) -> bool {
        self.replicas.contains(&replica)
    }

    /// Responses required for the slow path, counting the leader's own value.
    pub fn quorum_full(&self) -> usize {
        self.quorum_full
    }

    /// Peer responses required for the fast path, in addition to the leader's own value.
    pub fn quorum_fast(&self) -> usize {
        self.quorum_fast
    }

    pub fn fast_path_enabled(&self) -> bool {
        !self.options.disable_fast_path
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    pub fn jiffies(&self) -> u64 {
        self.options.jiffies_per_timeout
    }

    /// Allocate the next slot in this replica's id space.
    pub fn next_slot(&mut self) -> Slot {
        let slot = Slot::new(self.id, self.next_index);
        self.next_index += 1;
        slot
    }

    pub fn initial_ballot(&self) -> Ballot {
        Ballot::initial(self.epoch, self.id)
    }

    /// Ticks until the next recovery attempt for a slot on its `attempt`-th try:  exponential in
    /// the attempt with a jiffy of jitter so racing recoverers separate.
    pub fn backoff_delay(&mut self, attempt: u64) -> u64 {
        let shift = std::cmp::min(attempt.saturating_sub(1), 6);
        let base = self.options.jiffies_per_timeout << shift;
        let jitter: u64 = any(&mut self.jitter);
        base + jitter % self.options.jiffies_per_timeout
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[u32]) -> Vec<ReplicaID> {
        ids.iter().map(|id| ReplicaID::new(*id)).collect()
    }

    #[test]
    fn quorums_for_three() {
        let state =
            ReplicaState::new(ReplicaOptions::default(), 0, ReplicaID::new(1), ids(&[1, 2, 3]))
                .unwrap();
        assert_eq!(2, state.quorum_full());
        assert_eq!(2, state.quorum_fast());
    }

    #[test]
    fn quorums_for_five() {
        let state = ReplicaState::new(
            ReplicaOptions::default(),
            0,
            ReplicaID::new(1),
            ids(&[1, 2, 3, 4, 5]),
        )
        .unwrap();
        assert_eq!(3, state.quorum_full());
        assert_eq!(3, state.quorum_fast());
    }

    #[test]
    fn duplicate_replicas_are_fatal() {
        assert!(
            ReplicaState::new(ReplicaOptions::default(), 0, ReplicaID::new(1), ids(&[1, 2, 2]))
                .is_err()
        );
    }

    #[test]
    fn nonmember_is_fatal() {
        assert!(
            ReplicaState::new(ReplicaOptions::default(), 0, ReplicaID::new(9), ids(&[1, 2, 3]))
                .is_err()
        );
    }

    #[test]
    fn bad_quorum_is_fatal() {
        let options = ReplicaOptions {
            quorum_full: 1,
            ..ReplicaOptions::default()
        };
        assert!(ReplicaState::new(options, 0, ReplicaID::new(1), ids(&[1, 2, 3])).is_err());
    }

    #[test]
    fn slots_are_monotonic() {
        let mut state =
            ReplicaState::new(ReplicaOptions::default(), 0, ReplicaID::new(2), ids(&[1, 2, 3]))
                .unwrap();
        assert_eq!(Slot::new(ReplicaID::new(2), 0), state.next_slot());
        assert_eq!(Slot::new(ReplicaID::new(2), 1), state.next_slot());
    }

    #[test]
    fn backoff_grows() {
        let mut state =
            ReplicaState::new(ReplicaOptions::default(), 0, ReplicaID::new(1), ids(&[1, 2, 3]))
                .unwrap();
        let jiffies = state.jiffies();
        let first = state.backoff_delay(1);
        let fifth = state.backoff_delay(5);
        assert!(first >= jiffies && first < 2 * jiffies);
        assert!(fifth >= jiffies << 4);
    }
}
