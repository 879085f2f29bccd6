//! Paxos-replicated KV store.
//!
//! Every replica funnels client operations through the shared log driver,
//! so all replicas apply the same operations in the same order and any
//! replica can serve any client.

mod client;
mod server;

pub use client::KvClient;
pub use server::KvServer;

use serde::{Deserialize, Serialize};

/// Reply status tags for the KV service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrKind {
    /// Success.
    Ok,
    /// Key absent on Get.
    NoKey,
}

/// One client operation as agreed through the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvOp {
    /// Client identity nonce.
    pub client: u64,
    /// Per-operation nonce, stable across retries.
    pub op_id: u64,
    pub kind: KvKind,
}

/// Operation payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvKind {
    Get { key: String },
    Put { key: String, value: String },
    /// Stored value becomes `fnv1a(previous ++ value)` as a decimal string;
    /// the reply carries the previous value.
    PutHash { key: String, value: String },
}

/// Arguments of a Get operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client: u64,
    pub op_id: u64,
}

/// Reply of a Get operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub err: ErrKind,
    pub value: String,
}

/// Arguments of a Put or hashing Put operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutArgs {
    pub key: String,
    pub value: String,
    pub do_hash: bool,
    pub client: u64,
    pub op_id: u64,
}

/// Reply of a Put operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReply {
    pub err: ErrKind,
    pub previous_value: String,
}

/// Requests accepted by a KV replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvRequest {
    Get(GetArgs),
    Put(PutArgs),
}

/// Replies of a KV replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvReply {
    Get(GetReply),
    Put(PutReply),
}
