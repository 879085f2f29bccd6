//! Paxos-replicated shard master: assigns shards to replica groups.
//!
//! The shard master maintains an append-only sequence of configurations;
//! each names the replica groups in the system and maps every shard to one
//! of them. Join/Leave/Move produce new configurations through the log
//! driver, so every replica holds the identical sequence.

mod balance;
mod client;
mod server;

pub(crate) use balance::rebalance;
pub use client::ShardClient;
pub use server::ShardMaster;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Number of key-space shards, fixed for the lifetime of the system.
pub const NSHARDS: usize = 10;

/// Replica group identifier; 0 is the "unassigned" sentinel.
pub type Gid = u64;

/// One immutable entry in the configuration sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Configuration number, starting at 0 for the empty configuration.
    pub num: u64,

    /// Shard index -> owning group id.
    pub shards: [Gid; NSHARDS],

    /// Groups keyed by gid, each a list of server addresses. Kept ordered
    /// so that every replica iterates groups identically.
    pub groups: BTreeMap<Gid, Vec<String>>,
}

impl ShardConfig {
    /// Configuration 0: no groups, every shard on the sentinel gid.
    pub fn initial() -> Self {
        ShardConfig {
            num: 0,
            shards: [0; NSHARDS],
            groups: BTreeMap::new(),
        }
    }
}

/// One operation as agreed through the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmOp {
    /// Submitting server's identity nonce.
    pub client: u64,
    /// Per-operation nonce.
    pub op_id: u64,
    pub kind: SmKind,
}

/// Operation payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SmKind {
    /// Add a replica group and rebalance.
    Join { gid: Gid, servers: Vec<String> },
    /// Remove a replica group and rebalance.
    Leave { gid: Gid },
    /// Pin one shard to a group; no rebalance.
    Move { shard: usize, gid: Gid },
    /// Read a configuration: the one numbered `num`, or the latest for any
    /// number outside the produced range.
    Query { num: i64 },
}

/// Requests accepted by a shard master replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardRequest {
    Join { gid: Gid, servers: Vec<String> },
    Leave { gid: Gid },
    Move { shard: usize, gid: Gid },
    Query { num: i64 },
}

/// Replies of a shard master replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardReply {
    /// Join/Leave/Move acknowledgment.
    Ack,
    /// Query result.
    Config(ShardConfig),
}
