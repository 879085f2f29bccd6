//! Primary/backup replicated KV store driven by the view service.
//!
//! The primary executes every client operation, forwards the completed
//! reply to the backup before committing, and hands its full state to a
//! freshly appointed backup before adopting the new view. Dedupe logs keyed
//! by operation id give at-most-once semantics across client retries.

mod client;
mod server;

pub use client::PbClient;
pub use server::PbServer;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Reply status tags for the primary/backup service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrKind {
    /// Success.
    Ok,
    /// Key absent on Get.
    NoKey,
    /// Server is not in the role this request requires.
    WrongServer,
    /// Primary could not replicate to the backup; retry after a view fetch.
    Backup,
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct PbConfig {
    /// View service ping interval in millisecs.
    pub ping_interval_ms: u64,

    /// Per-RPC timeout in millisecs for forwards to the backup.
    pub call_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for PbConfig {
    fn default() -> Self {
        PbConfig {
            ping_interval_ms: 100,
            call_timeout_ms: 500,
        }
    }
}

/// Arguments of a Get operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    /// Client identity nonce, scoping the dedupe check.
    pub client: u64,
    /// Per-operation nonce, stable across retries of the same operation.
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
    /// When set, the stored value becomes `fnv1a(previous ++ value)` as a
    /// decimal string and the reply carries the previous value.
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

/// Dedupe log record of a completed Get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetEntry {
    pub reply: GetReply,
    pub client: u64,
}

/// Dedupe log record of a completed Put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutEntry {
    pub reply: PutReply,
    pub client: u64,
}

/// Requests accepted by a primary/backup server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PbRequest {
    /// Client Get, served by the primary.
    Get(GetArgs),

    /// Client Put / hashing Put, served by the primary.
    Put(PutArgs),

    /// Completed Get reply forwarded by the primary for backup logging.
    ForwardGet { args: GetArgs, reply: GetReply },

    /// Completed Put reply forwarded by the primary for backup replay.
    ForwardPut { args: PutArgs, reply: PutReply },

    /// Full state transfer to a freshly appointed backup.
    ForwardState {
        primary: String,
        store: HashMap<String, String>,
        gets: HashMap<u64, GetEntry>,
        puts: HashMap<u64, PutEntry>,
    },
}

/// Replies of a primary/backup server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PbReply {
    Get(GetReply),
    Put(PutReply),
    Forward { err: ErrKind },
}
