//! Client stub for the shard master service.

use std::net::SocketAddr;

use tokio::time::{self, Duration};

use crate::shard::{Gid, ShardConfig, ShardReply, ShardRequest};
use crate::utils::{rpc, SynodError};

/// Per-RPC timeout towards a replica.
const CALL_TIMEOUT: Duration = Duration::from_millis(3000);

/// Pause between attempts against successive replicas.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Shard master client. Rotates through the replica list until one answers.
pub struct ShardClient {
    servers: Vec<SocketAddr>,
}

impl ShardClient {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        ShardClient { servers }
    }

    /// Adds replica group `gid` backed by `servers` and rebalances.
    pub async fn join(&self, gid: Gid, servers: Vec<String>) {
        self.submit(ShardRequest::Join { gid, servers }).await;
    }

    /// Removes replica group `gid` and rebalances.
    pub async fn leave(&self, gid: Gid) {
        self.submit(ShardRequest::Leave { gid }).await;
    }

    /// Pins `shard` to group `gid` without rebalancing.
    pub async fn move_shard(&self, shard: usize, gid: Gid) {
        self.submit(ShardRequest::Move { shard, gid }).await;
    }

    /// Reads configuration `num`, or the latest for a number outside the
    /// produced range (conventionally -1).
    pub async fn query(&self, num: i64) -> ShardConfig {
        match self.submit(ShardRequest::Query { num }).await {
            ShardReply::Config(config) => config,
            ShardReply::Ack => unreachable!("query answered with ack"),
        }
    }

    async fn submit(&self, req: ShardRequest) -> ShardReply {
        let mut attempt = 0;
        loop {
            let server = self.servers[attempt % self.servers.len()];
            let result: Result<ShardReply, SynodError> =
                rpc::call(server, &req, CALL_TIMEOUT).await;
            if let Ok(reply) = result {
                return reply;
            }
            attempt += 1;
            time::sleep(RETRY_INTERVAL).await;
        }
    }
}
