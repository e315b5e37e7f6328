use raft::eraftpb::ConfChange;
use tokio::sync::oneshot::{self, Receiver, Sender};

use crate::error::NodeError;

/// Result of a replicated apply, as produced by the state machine and
/// routed back to the submitter.
pub type ApplyResult = Result<(), NodeError>;

/// A command or configuration change waiting to travel through the log.
///
/// `proposed` is filled with the log index the entry landed at once the
/// leader accepts it; the completion channel fires when that index is
/// applied, or earlier when the proposal is rejected.
pub struct Proposal {
    pub command: Option<Vec<u8>>,
    pub conf_change: Option<ConfChange>,
    pub proposed: u64,
    reply: Option<Sender<ApplyResult>>,
}

impl Proposal {
    pub fn command(data: Vec<u8>) -> (Self, Receiver<ApplyResult>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            command: Some(data),
            conf_change: None,
            proposed: 0,
            reply: Some(tx),
        };
        (proposal, rx)
    }

    pub fn conf_change(cc: ConfChange) -> (Self, Receiver<ApplyResult>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            command: None,
            conf_change: Some(cc),
            proposed: 0,
            reply: Some(tx),
        };
        (proposal, rx)
    }

    /// Completes the proposal. The submitter may have stopped waiting;
    /// a dropped receiver is not an error here.
    pub fn finish(&mut self, result: ApplyResult) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }
}
