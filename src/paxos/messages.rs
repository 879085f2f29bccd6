//! Peer-to-peer acceptor protocol messages.

use serde::{Deserialize, Serialize};

use crate::paxos::{Proposal, Seq};

/// Request to an acceptor. One variant per protocol phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerRequest<V> {
    /// Phase 1: promise solicitation for proposal number `n`.
    Prepare { seq: Seq, n: Proposal },

    /// Phase 2: acceptance solicitation for `value` at proposal `n`.
    Accept { seq: Seq, n: Proposal, value: V },

    /// Phase 3: decision announcement. Only ever sent by a proposer that
    /// reached an accept majority, so acceptors trust it unconditionally.
    Decided { seq: Seq, n: Proposal, value: V },
}

/// Reply from an acceptor. Every variant piggybacks the replier's highest
/// `done` sequence so that `min()` can advance without extra traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerReply<V> {
    /// Promise (or rejection) carrying the highest accepted proposal and its
    /// value, for the proposer's value adoption rule.
    Prepare {
        n_a: Proposal,
        v_a: Option<V>,
        reject: bool,
        done: Seq,
    },

    /// Acceptance or rejection.
    Accept { reject: bool, done: Seq },

    /// Decision acknowledgment; never a rejection.
    Decided { reject: bool, done: Seq },
}
