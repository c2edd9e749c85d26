#![doc = include_str!("../README.md")]

use prototk_derive::Message;

use zerror_core::ErrorCore;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(581632, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(581633, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: prototk::Error,
    },
    #[prototk(581634, message)]
    InvalidConfiguration {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

///////////////////////////////////////////// ReplicaID ////////////////////////////////////////////

/// The identity of one replica in the ensemble.  Identifiers are dense small integers assigned by
/// the operator; they double as the first component of every [Slot] the replica leads.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct ReplicaID {
    #[prototk(1, uint32)]
    pub id: u32,
}

impl ReplicaID {
    /// The smallest possible replica ID.
    pub const BOTTOM: ReplicaID = ReplicaID { id: 0 };

    /// The largest possible replica ID.
    pub const TOP: ReplicaID = ReplicaID { id: u32::MAX };

    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

impl std::fmt::Display for ReplicaID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "replica:{}", self.id)
    }
}

impl From<PeerID> for ReplicaID {
    fn from(peer: PeerID) -> Self {
        Self { id: peer.id }
    }
}

////////////////////////////////////////////// PeerID //////////////////////////////////////////////

/// A transport address.  Replicas and clients share one address space; a replica's peer ID is
/// numerically its replica ID.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct PeerID {
    #[prototk(1, uint32)]
    pub id: u32,
}

impl PeerID {
    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

impl std::fmt::Display for PeerID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "peer:{}", self.id)
    }
}

impl From<ReplicaID> for PeerID {
    fn from(replica: ReplicaID) -> Self {
        Self { id: replica.id }
    }
}

/////////////////////////////////////////////// Slot ///////////////////////////////////////////////

/// The globally-unique identifier of one consensus instance.  Each replica assigns monotonically
/// increasing indices within its own ID space, so slots never collide across leaders.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct Slot {
    #[prototk(1, message)]
    pub replica: ReplicaID,
    #[prototk(2, uint64)]
    pub index: u64,
}

impl Slot {
    pub const fn new(replica: ReplicaID, index: u64) -> Self {
        Self { replica, index }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "({},{})", self.replica.id, self.index)
    }
}

////////////////////////////////////////////// Ballot //////////////////////////////////////////////

/// Ballots order competing proposers for a single slot.  The comparison is lexicographic by
/// (epoch, number, leader), so a proposer whose ballot is superseded can always select a third
/// ballot that supersedes both.  Every instance begins life at ballot (epoch, 0, leader-of-slot).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct Ballot {
    #[prototk(1, uint32)]
    pub epoch: u32,
    #[prototk(2, uint32)]
    pub number: u32,
    #[prototk(3, message)]
    pub leader: ReplicaID,
}

impl Ballot {
    /// The smallest possible ballot.
    pub const BOTTOM: Ballot = Ballot {
        epoch: 0,
        number: 0,
        leader: ReplicaID::BOTTOM,
    };

    /// The largest possible ballot.
    pub const TOP: Ballot = Ballot {
        epoch: u32::MAX,
        number: u32::MAX,
        leader: ReplicaID::TOP,
    };

    /// The ballot every instance of `slot_owner` starts at.
    pub const fn initial(epoch: u32, slot_owner: ReplicaID) -> Self {
        Self {
            epoch,
            number: 0,
            leader: slot_owner,
        }
    }

    /// A ballot strictly greater than `self`, owned by `leader`.
    pub const fn superseding(&self, leader: ReplicaID) -> Self {
        Self {
            epoch: self.epoch,
            number: self.number + 1,
            leader,
        }
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "({},{},{})", self.epoch, self.number, self.leader.id)
    }
}

////////////////////////////////////////////// Command /////////////////////////////////////////////

/// A command is an opaque payload with a key.  Two commands interfere iff their keys collide.
/// No-ops fill slots abandoned by crashed leaders and interfere with nothing.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum Command {
    #[prototk(1, message)]
    #[default]
    Nop,
    #[prototk(2, message)]
    Op {
        #[prototk(1, bytes)]
        key: Vec<u8>,
        #[prototk(2, bytes)]
        payload: Vec<u8>,
    },
}

impl Command {
    pub fn op(key: &[u8], payload: &[u8]) -> Self {
        Self::Op {
            key: key.to_vec(),
            payload: payload.to_vec(),
        }
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, Command::Nop)
    }

    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Command::Nop => None,
            Command::Op { key, .. } => Some(key),
        }
    }

    pub fn interferes(&self, other: &Command) -> bool {
        match (self.key(), other.key()) {
            (Some(lhs), Some(rhs)) => lhs == rhs,
            _ => false,
        }
    }
}

////////////////////////////////////////////// Status //////////////////////////////////////////////

/// The phase an instance has reached.  Totally ordered:  an instance only ever moves forward,
/// except that a superseding ballot may rewind Accepted to PreAccepted during recovery.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub enum Status {
    #[prototk(1, message)]
    #[default]
    Prepared,
    #[prototk(2, message)]
    PreAccepted,
    #[prototk(3, message)]
    Accepted,
    #[prototk(4, message)]
    Committed,
    #[prototk(5, message)]
    Executed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        let what = match self {
            Status::Prepared => "prepared",
            Status::PreAccepted => "pre-accepted",
            Status::Accepted => "accepted",
            Status::Committed => "committed",
            Status::Executed => "executed",
        };
        write!(f, "{what}")
    }
}

/////////////////////////////////////////// ClientRequest //////////////////////////////////////////

/// A client asks the receiving replica to lead consensus on `command`.
#[derive(Clone, Debug, Default, Message)]
pub struct ClientRequest {
    #[prototk(1, message)]
    pub client: PeerID,
    #[prototk(2, message)]
    pub command: Command,
}

////////////////////////////////////////// ClientResponse //////////////////////////////////////////

/// Sent to the client once its command has been executed.
#[derive(Clone, Debug, Default, Message)]
pub struct ClientResponse {
    #[prototk(1, message)]
    pub client: PeerID,
    #[prototk(2, message)]
    pub command: Command,
}

////////////////////////////////////////// PreAcceptRequest ////////////////////////////////////////

/// Phase one of the protocol:  the leader proposes (command, seq, deps) for `slot` and each
/// acceptor augments the proposal with the interference it has witnessed locally.
#[derive(Clone, Debug, Default, Message)]
pub struct PreAcceptRequest {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, message)]
    pub command: Command,
    #[prototk(4, uint64)]
    pub seq: u64,
    #[prototk(5, message)]
    pub deps: Vec<Slot>,
}

//////////////////////////////////////////// PreAcceptAck //////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct PreAcceptAck {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, uint64)]
    pub seq: u64,
    #[prototk(4, message)]
    pub deps: Vec<Slot>,
}

/////////////////////////////////////////// PreAcceptNack //////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct PreAcceptNack {
    #[prototk(1, message)]
    pub slot: Slot,
}

//////////////////////////////////////////// AcceptRequest /////////////////////////////////////////

/// The slow path:  the leader fixes (command, seq, deps) at `ballot` after unioning a quorum of
/// pre-accept answers.
#[derive(Clone, Debug, Default, Message)]
pub struct AcceptRequest {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, message)]
    pub command: Command,
    #[prototk(4, uint64)]
    pub seq: u64,
    #[prototk(5, message)]
    pub deps: Vec<Slot>,
}

////////////////////////////////////////////// AcceptAck ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct AcceptAck {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
}

///////////////////////////////////////////// AcceptNack ///////////////////////////////////////////

/// Carries the acceptor's current ballot so a superseded leader learns how far to advance.
#[derive(Clone, Debug, Default, Message)]
pub struct AcceptNack {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
}

//////////////////////////////////////////// CommitRequest /////////////////////////////////////////

/// Commit is authoritative:  a value committed at any ballot is, by construction, at or above the
/// highest ballot promised by any quorum for this slot.  There is no reply.
#[derive(Clone, Debug, Default, Message)]
pub struct CommitRequest {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, uint64)]
    pub seq: u64,
    #[prototk(4, message)]
    pub command: Command,
    #[prototk(5, message)]
    pub deps: Vec<Slot>,
}

/////////////////////////////////////////// PrepareRequest /////////////////////////////////////////

/// The recovery path:  rally support for `ballot` and learn the most advanced surviving view of
/// `slot`.
#[derive(Clone, Debug, Default, Message)]
pub struct PrepareRequest {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
}

///////////////////////////////////////////// PrepareAck ///////////////////////////////////////////

/// The acceptor's view of `slot` from before the ballot was raised.  `ballot` is the pre-raise
/// ballot; `command` is a placeholder no-op when `status` is Prepared.
#[derive(Clone, Debug, Default, Message)]
pub struct PrepareAck {
    #[prototk(1, message)]
    pub slot: Slot,
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(3, message)]
    pub command: Command,
    #[prototk(4, uint64)]
    pub seq: u64,
    #[prototk(5, message)]
    pub deps: Vec<Slot>,
    #[prototk(6, message)]
    pub status: Status,
}

///////////////////////////////////////////// PrepareNack //////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct PrepareNack {
    #[prototk(1, message)]
    pub slot: Slot,
}

/////////////////////////////////////////// ReplicaMessage /////////////////////////////////////////

/// Every datagram on the wire is one of these.  Each kind has exactly one handler.
#[derive(Clone, Debug, Message)]
pub enum ReplicaMessage {
    #[prototk(1, message)]
    ClientRequest(ClientRequest),
    #[prototk(2, message)]
    ClientResponse(ClientResponse),
    #[prototk(3, message)]
    PreAcceptRequest(PreAcceptRequest),
    #[prototk(4, message)]
    PreAcceptAck(PreAcceptAck),
    #[prototk(5, message)]
    PreAcceptNack(PreAcceptNack),
    #[prototk(6, message)]
    AcceptRequest(AcceptRequest),
    #[prototk(7, message)]
    AcceptAck(AcceptAck),
    #[prototk(8, message)]
    AcceptNack(AcceptNack),
    #[prototk(9, message)]
    CommitRequest(CommitRequest),
    #[prototk(10, message)]
    PrepareRequest(PrepareRequest),
    #[prototk(11, message)]
    PrepareAck(PrepareAck),
    #[prototk(12, message)]
    PrepareNack(PrepareNack),
}

impl Default for ReplicaMessage {
    fn default() -> Self {
        Self::ClientRequest(ClientRequest::default())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
