//! Client stub for the Paxos-replicated KV service.

use std::net::SocketAddr;

use tokio::time::{self, Duration};

use crate::kv::{GetArgs, KvReply, KvRequest, PutArgs};
use crate::utils::{rpc, SynodError};

/// Per-RPC timeout towards a replica.
const CALL_TIMEOUT: Duration = Duration::from_millis(3000);

/// Pause between attempts against successive replicas.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// KV client. Rotates through the replica list until one answers; the
/// operation id stays stable across retries, so a committed operation
/// always resolves to the same reply.
pub struct KvClient {
    servers: Vec<SocketAddr>,

    /// Client identity nonce scoping the dedupe logs.
    client: u64,
}

impl KvClient {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        KvClient {
            servers,
            client: rand::random(),
        }
    }

    /// Fetches the value under `key`; an absent key reads as the empty
    /// string. Retries across replicas indefinitely.
    pub async fn get(&self, key: &str) -> String {
        let args = GetArgs {
            key: key.into(),
            client: self.client,
            op_id: rand::random(),
        };
        let mut attempt = 0;
        loop {
            let server = self.servers[attempt % self.servers.len()];
            let result: Result<KvReply, SynodError> =
                rpc::call(server, &KvRequest::Get(args.clone()), CALL_TIMEOUT)
                    .await;
            if let Ok(KvReply::Get(reply)) = result {
                return reply.value;
            }
            attempt += 1;
            time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Stores `value` under `key`.
    pub async fn put(&self, key: &str, value: &str) {
        self.put_ext(key, value, false).await;
    }

    /// Hashing put: the stored value becomes `fnv1a(previous ++ value)` as
    /// a decimal string; returns the previous value.
    pub async fn put_hash(&self, key: &str, value: &str) -> String {
        self.put_ext(key, value, true).await
    }

    async fn put_ext(&self, key: &str, value: &str, do_hash: bool) -> String {
        let args = PutArgs {
            key: key.into(),
            value: value.into(),
            do_hash,
            client: self.client,
            op_id: rand::random(),
        };
        let mut attempt = 0;
        loop {
            let server = self.servers[attempt % self.servers.len()];
            let result: Result<KvReply, SynodError> =
                rpc::call(server, &KvRequest::Put(args.clone()), CALL_TIMEOUT)
                    .await;
            if let Ok(KvReply::Put(reply)) = result {
                return reply.previous_value;
            }
            attempt += 1;
            time::sleep(RETRY_INTERVAL).await;
        }
    }
}
