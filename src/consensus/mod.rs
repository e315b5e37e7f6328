//! Consensus engine. tikv's raft crate supplies leader election, log
//! replication and commit advancement; this module supplies the durable
//! stores it requires, the single actor that drives it, and the handle the
//! rest of the node talks to.

pub mod node;
pub mod observer;
pub mod proposal;
pub mod storage;

use crate::error::NodeError;

/// Contract between the consensus engine and the replicated state machine.
///
/// `apply` is invoked strictly in log order on every node. A semantic
/// error (for example deleting a key that does not exist) is routed back
/// to the submitter on the leader and must not halt the machine, because
/// the same entry produces the same error on every replica. A fatal error
/// aborts the node.
pub trait StateMachine: Send + 'static {
    /// Apply a committed entry to the state machine.
    fn apply(&mut self, index: u64, data: &[u8]) -> Result<(), NodeError>;

    /// Produce a self-describing encoding of the full state.
    fn snapshot(&self) -> Result<Vec<u8>, NodeError>;

    /// Atomically replace the state from a snapshot taken at
    /// `(last_index, last_term)`.
    fn restore(&mut self, last_index: u64, last_term: u64, data: &[u8]) -> Result<(), NodeError>;
}

/// Classified result of a bootstrap attempt. Nothing is ever inferred
/// from error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This node wrote the initial configuration; consensus completes on
    /// its own as the other bootstrap peers come up.
    Bootstrapped,
    /// A configuration already exists on disk; the node is resuming.
    AlreadyBootstrapped,
    /// The bootstrap set does not list this node; it must join the live
    /// cluster explicitly.
    NotAVoter,
}
