//! Shard master server replica.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::driver::{LogDriver, StateMachine};
use crate::paxos::{PaxosConfig, PaxosPeer};
use crate::shard::{
    rebalance, ShardConfig, ShardReply, ShardRequest, SmKind, SmOp,
};
use crate::utils::{rpc, SynodError};

/// The shard master application state machine: the append-only sequence of
/// configurations.
pub(crate) struct SmMachine {
    configs: Vec<ShardConfig>,
}

impl SmMachine {
    /// Duplicate of the newest configuration with the number bumped.
    fn duplicate_last(&self) -> ShardConfig {
        let mut config = self.configs[self.configs.len() - 1].clone();
        config.num += 1;
        config
    }

    /// The configuration numbered `num`, or the newest one for any number
    /// outside the produced range.
    fn lookup(&self, num: i64) -> ShardConfig {
        if num >= 0 && (num as usize) < self.configs.len() {
            self.configs[num as usize].clone()
        } else {
            self.configs[self.configs.len() - 1].clone()
        }
    }
}

impl StateMachine for SmMachine {
    type Op = SmOp;
    type Output = Option<ShardConfig>;

    fn ids(op: &SmOp) -> (u64, u64) {
        (op.client, op.op_id)
    }

    fn apply(&mut self, op: &SmOp) -> Option<ShardConfig> {
        match &op.kind {
            SmKind::Join { gid, servers } => {
                let mut config = self.duplicate_last();
                config.groups.insert(*gid, servers.clone());
                rebalance(&mut config);
                self.configs.push(config);
                None
            }
            SmKind::Leave { gid } => {
                let mut config = self.duplicate_last();
                config.groups.remove(gid);
                rebalance(&mut config);
                self.configs.push(config);
                None
            }
            SmKind::Move { shard, gid } => {
                let mut config = self.duplicate_last();
                if *shard < config.shards.len() {
                    config.shards[*shard] = *gid;
                }
                self.configs.push(config);
                None
            }
            SmKind::Query { num } => Some(self.lookup(*num)),
        }
    }
}

/// One replica of the Paxos-replicated shard master.
pub struct ShardMaster {
    /// My replica index.
    me: usize,

    /// The embedded Paxos peer.
    paxos: Arc<PaxosPeer<crate::driver::LogEntry<SmOp>>>,

    /// Termination signal sender.
    tx_term: watch::Sender<bool>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl ShardMaster {
    /// Creates a shard master replica: embeds a Paxos peer bound at
    /// `peers[me]` and listens for client requests on `api_addr`.
    pub async fn new_and_setup(
        api_addr: SocketAddr,
        peers: Vec<SocketAddr>,
        me: usize,
        paxos_config: PaxosConfig,
    ) -> Result<Self, SynodError> {
        let paxos =
            Arc::new(PaxosPeer::new_and_setup(peers, me, paxos_config).await?);
        let driver = Arc::new(Mutex::new(LogDriver::new(
            me,
            SmMachine {
                configs: vec![ShardConfig::initial()],
            },
            paxos.clone(),
        )));
        let (tx_term, rx_term) = watch::channel(false);
        let identity = rand::random();

        let listener = rpc::tcp_bind(api_addr).await?;
        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            me,
            identity,
            listener,
            driver,
            rx_term,
        ));

        Ok(ShardMaster {
            me,
            paxos,
            tx_term,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Requests shutdown of the API acceptor and the embedded Paxos peer.
    pub fn kill(&self) {
        pf_debug!(self.me; "kill requested");
        let _ = self.tx_term.send(true);
        self.paxos.kill();
    }

    async fn acceptor_task(
        me: usize,
        identity: u64,
        listener: TcpListener,
        driver: Arc<Mutex<LogDriver<SmMachine>>>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "api acceptor task spawned");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tokio::spawn(Self::connection_task(
                                identity,
                                stream,
                                driver.clone(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!(me; "error accepting connection: {}", e);
                        }
                    }
                },
                _ = rx_term.changed() => break,
            }
        }
        pf_debug!(me; "api acceptor task exited");
    }

    async fn connection_task(
        identity: u64,
        stream: TcpStream,
        driver: Arc<Mutex<LogDriver<SmMachine>>>,
    ) {
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let (mut conn_read, mut conn_write) = stream.into_split();
        loop {
            let req: ShardRequest =
                match rpc::recv_framed(&mut read_buf, &mut conn_read).await {
                    Ok(req) => req,
                    Err(_) => return,
                };
            let kind = match req {
                ShardRequest::Join { gid, servers } => {
                    SmKind::Join { gid, servers }
                }
                ShardRequest::Leave { gid } => SmKind::Leave { gid },
                ShardRequest::Move { shard, gid } => {
                    SmKind::Move { shard, gid }
                }
                ShardRequest::Query { num } => SmKind::Query { num },
            };
            let op = SmOp {
                client: identity,
                op_id: rand::random(),
                kind,
            };
            let output = driver.lock().await.submit(op).await;
            let reply = match output {
                Some(config) => ShardReply::Config(config),
                None => ShardReply::Ack,
            };
            if rpc::send_framed(&mut conn_write, &reply).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod machine_tests {
    use super::*;
    use crate::shard::{Gid, NSHARDS};

    fn machine() -> SmMachine {
        SmMachine {
            configs: vec![ShardConfig::initial()],
        }
    }

    fn op(kind: SmKind) -> SmOp {
        SmOp {
            client: 1,
            op_id: rand::random(),
            kind,
        }
    }

    #[test]
    fn configs_are_append_only() {
        let mut m = machine();
        m.apply(&op(SmKind::Join {
            gid: 100,
            servers: vec!["s1".into()],
        }));
        m.apply(&op(SmKind::Join {
            gid: 101,
            servers: vec!["s2".into()],
        }));
        assert_eq!(m.configs.len(), 3);
        for (num, config) in m.configs.iter().enumerate() {
            assert_eq!(config.num, num as u64);
        }
        // the older configuration is untouched by the newer one
        assert!(m.configs[1].shards.iter().all(|&gid| gid == 100));
    }

    #[test]
    fn move_pins_without_rebalance() {
        let mut m = machine();
        m.apply(&op(SmKind::Join {
            gid: 100,
            servers: vec!["s1".into()],
        }));
        m.apply(&op(SmKind::Move { shard: 3, gid: 77 }));
        let last = &m.configs[m.configs.len() - 1];
        assert_eq!(last.shards[3], 77);
        for shard in (0..NSHARDS).filter(|&s| s != 3) {
            assert_eq!(last.shards[shard], 100);
        }
    }

    #[test]
    fn query_reads_history_and_latest() {
        let mut m = machine();
        m.apply(&op(SmKind::Join {
            gid: 5,
            servers: vec!["s1".into()],
        }));
        let c0 = m.apply(&op(SmKind::Query { num: 0 })).unwrap();
        assert_eq!(c0.num, 0);
        assert!(c0.groups.is_empty());

        let latest = m.apply(&op(SmKind::Query { num: -1 })).unwrap();
        assert_eq!(latest.num, 1);
        assert!(latest.groups.contains_key(&(5 as Gid)));

        let beyond = m.apply(&op(SmKind::Query { num: 99 })).unwrap();
        assert_eq!(beyond.num, latest.num);
    }
}
