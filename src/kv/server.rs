//! Paxos-replicated KV server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::driver::{LogDriver, StateMachine};
use crate::kv::{
    ErrKind, GetReply, KvKind, KvOp, KvReply, KvRequest, PutReply,
};
use crate::paxos::{PaxosConfig, PaxosPeer};
use crate::utils::{fnv1a, rpc, SynodError};

/// The KV application state machine: an in-memory string map.
pub(crate) struct KvMachine {
    store: HashMap<String, String>,
}

/// Output of one applied operation. `found` distinguishes a Get miss from
/// an empty stored value.
#[derive(Debug, Clone)]
pub(crate) struct KvOutput {
    value: String,
    found: bool,
}

impl StateMachine for KvMachine {
    type Op = KvOp;
    type Output = KvOutput;

    fn ids(op: &KvOp) -> (u64, u64) {
        (op.client, op.op_id)
    }

    fn apply(&mut self, op: &KvOp) -> KvOutput {
        match &op.kind {
            KvKind::Get { key } => match self.store.get(key) {
                Some(value) => KvOutput {
                    value: value.clone(),
                    found: true,
                },
                None => KvOutput {
                    value: String::new(),
                    found: false,
                },
            },
            KvKind::Put { key, value } => {
                self.store.insert(key.clone(), value.clone());
                KvOutput {
                    value: String::new(),
                    found: true,
                }
            }
            KvKind::PutHash { key, value } => {
                let previous =
                    self.store.get(key).cloned().unwrap_or_default();
                let hashed =
                    fnv1a(&format!("{}{}", previous, value)).to_string();
                self.store.insert(key.clone(), hashed);
                KvOutput {
                    value: previous,
                    found: true,
                }
            }
        }
    }
}

/// One replica of the Paxos-replicated KV service.
pub struct KvServer {
    /// My replica index.
    me: usize,

    /// The embedded Paxos peer (also reachable by the other replicas).
    paxos: Arc<PaxosPeer<crate::driver::LogEntry<KvOp>>>,

    /// Termination signal sender.
    tx_term: watch::Sender<bool>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl KvServer {
    /// Creates a KV replica: embeds a Paxos peer bound at `peers[me]` and
    /// listens for client requests on `api_addr`.
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
            KvMachine {
                store: HashMap::new(),
            },
            paxos.clone(),
        )));
        let (tx_term, rx_term) = watch::channel(false);

        let listener = rpc::tcp_bind(api_addr).await?;
        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            me,
            listener,
            driver,
            rx_term,
        ));

        Ok(KvServer {
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
        listener: TcpListener,
        driver: Arc<Mutex<LogDriver<KvMachine>>>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "api acceptor task spawned");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tokio::spawn(Self::connection_task(
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
        stream: TcpStream,
        driver: Arc<Mutex<LogDriver<KvMachine>>>,
    ) {
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let (mut conn_read, mut conn_write) = stream.into_split();
        loop {
            let req: KvRequest =
                match rpc::recv_framed(&mut read_buf, &mut conn_read).await {
                    Ok(req) => req,
                    Err(_) => return,
                };
            let reply = match req {
                KvRequest::Get(args) => {
                    let op = KvOp {
                        client: args.client,
                        op_id: args.op_id,
                        kind: KvKind::Get { key: args.key },
                    };
                    let output = driver.lock().await.submit(op).await;
                    KvReply::Get(GetReply {
                        err: if output.found {
                            ErrKind::Ok
                        } else {
                            ErrKind::NoKey
                        },
                        value: output.value,
                    })
                }
                KvRequest::Put(args) => {
                    let kind = if args.do_hash {
                        KvKind::PutHash {
                            key: args.key,
                            value: args.value,
                        }
                    } else {
                        KvKind::Put {
                            key: args.key,
                            value: args.value,
                        }
                    };
                    let op = KvOp {
                        client: args.client,
                        op_id: args.op_id,
                        kind,
                    };
                    let output = driver.lock().await.submit(op).await;
                    KvReply::Put(PutReply {
                        err: ErrKind::Ok,
                        previous_value: output.value,
                    })
                }
            };
            if rpc::send_framed(&mut conn_write, &reply).await.is_err() {
                return;
            }
        }
    }
}
