//! Public interface to the synod library, linked by the daemon executables
//! and the integration tests.
//!
//! The crate layers progressively stronger replication abstractions: a view
//! service electing a primary/backup pair among live servers, a
//! primary/backup KV store driven by it, a Paxos library agreeing on a
//! shared sequence of numbered instances, and two Paxos-replicated state
//! machines (a KV store and a shard master) built on a common log driver.

#[macro_use]
mod utils;

mod driver;
mod kv;
mod paxos;
mod pb;
mod shard;
mod view;

pub use utils::rpc;
pub use utils::{fnv1a, SynodError};

pub use paxos::{PaxosConfig, PaxosPeer, PaxosValue, Proposal, Seq};

pub use view::{View, ViewClient, ViewConfig, ViewServer};

pub use pb::{
    ErrKind as PbErrKind, GetArgs as PbGetArgs, GetReply as PbGetReply,
    PbClient, PbConfig, PbRequest, PbReply, PbServer, PutArgs as PbPutArgs,
    PutReply as PbPutReply,
};

pub use kv::{
    ErrKind as KvErrKind, GetArgs as KvGetArgs, GetReply as KvGetReply,
    KvClient, KvRequest, KvReply, KvServer, PutArgs as KvPutArgs,
    PutReply as KvPutReply,
};

pub use shard::{
    Gid, ShardClient, ShardConfig, ShardMaster, ShardReply, ShardRequest,
    NSHARDS,
};
