//! Paxos consensus library: one Synod agreement per numbered log instance.
//!
//! Applications call `start()` to initiate agreement on a sequence number,
//! poll `status()` for the local view of the decision, and advance `done()`
//! so that instances everyone has finished with can be garbage collected
//! cluster-wide. The peer set is fixed at construction.

mod durability;
mod messages;
mod peer;
mod proposer;

pub use peer::PaxosPeer;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Log instance sequence number. Valid instances are `>= 0`; `-1` is the
/// "never" sentinel used by done tables and `max()`.
pub type Seq = i64;

/// Proposal number; `-1` means none seen yet. Uniqueness across peers comes
/// from the `(me + seq) mod N` residue each proposer sticks to.
pub type Proposal = i64;

/// Bounds required of values driven through the log.
pub trait PaxosValue:
    fmt::Debug
    + Clone
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> PaxosValue for T where
    T: fmt::Debug
        + Clone
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct PaxosConfig {
    /// Garbage collection sweep interval in millisecs.
    pub gc_interval_ms: u64,

    /// Per-RPC timeout in millisecs; expiry counts as "no reply".
    pub call_timeout_ms: u64,

    /// Directory for durable instance records; empty string disables
    /// persistence.
    pub storage_dir: String,
}

#[allow(clippy::derivable_impls)]
impl Default for PaxosConfig {
    fn default() -> Self {
        PaxosConfig {
            gc_interval_ms: 500,
            call_timeout_ms: 500,
            storage_dir: String::new(),
        }
    }
}
