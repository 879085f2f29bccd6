//! Paxos peer: acceptor state and handlers, public API, background tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::paxos::messages::{PeerReply, PeerRequest};
use crate::paxos::proposer::{self, ProposerCtx};
use crate::paxos::{durability, PaxosConfig, PaxosValue, Proposal, Seq};
use crate::utils::{rpc, SynodError};

/// Acceptor-side record of one log instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Instance<V> {
    /// Highest proposal number promised.
    pub(crate) n_p: Proposal,

    /// Highest proposal number accepted.
    pub(crate) n_a: Proposal,

    /// Value accepted at `n_a`.
    pub(crate) v_a: Option<V>,

    /// Terminal agreement flag; once set, `v_a` never changes.
    pub(crate) decided: bool,
}

impl<V> Default for Instance<V> {
    fn default() -> Self {
        Instance {
            n_p: -1,
            n_a: -1,
            v_a: None,
            decided: false,
        }
    }
}

/// Mutable peer state, guarded by the single peer mutex.
pub(crate) struct PeerState<V> {
    /// My peer index (for the done table and log prefixes).
    pub(crate) me: usize,

    /// Per-sequence instance records, created on first touch and deleted by
    /// the garbage collector once below `min()`.
    pub(crate) instances: HashMap<Seq, Instance<V>>,

    /// Highest sequence each peer has declared finished with (-1 = never).
    pub(crate) done: Vec<Seq>,

    /// Highest sequence number observed in any API call.
    pub(crate) nseq: Seq,
}

impl<V: PaxosValue> PeerState<V> {
    fn observe_seq(&mut self, seq: Seq) {
        if seq > self.nseq {
            self.nseq = seq;
        }
    }

    /// One greater than the cluster-wide minimum of exchanged `done`
    /// sequences; instances below this are forgotten.
    pub(crate) fn min(&self) -> Seq {
        self.done.iter().copied().min().unwrap_or(-1) + 1
    }

    /// Acceptor's prepare handler: promise not to honor proposals below `n`.
    /// Returns the reply and, on a state change, the record to persist.
    pub(crate) fn prepare(
        &mut self,
        seq: Seq,
        n: Proposal,
    ) -> (PeerReply<V>, Option<Instance<V>>) {
        self.observe_seq(seq);
        let done = self.done[self.me];
        let inst = self.instances.entry(seq).or_default();
        if n > inst.n_p {
            let reply = PeerReply::Prepare {
                n_a: inst.n_a,
                v_a: inst.v_a.clone(),
                reject: false,
                done,
            };
            inst.n_p = n;
            (reply, Some(inst.clone()))
        } else {
            let reply = PeerReply::Prepare {
                n_a: -1,
                v_a: None,
                reject: true,
                done,
            };
            (reply, None)
        }
    }

    /// Acceptor's accept handler: adopt `value` if `n` is at least the
    /// highest promised proposal.
    pub(crate) fn accept(
        &mut self,
        seq: Seq,
        n: Proposal,
        value: V,
    ) -> (PeerReply<V>, Option<Instance<V>>) {
        self.observe_seq(seq);
        let done = self.done[self.me];
        let inst = self.instances.entry(seq).or_default();
        if n >= inst.n_p {
            inst.n_p = n;
            inst.n_a = n;
            inst.v_a = Some(value);
            (
                PeerReply::Accept {
                    reject: false,
                    done,
                },
                Some(inst.clone()),
            )
        } else {
            (PeerReply::Accept { reject: true, done }, None)
        }
    }

    /// Learner's decision handler. Idempotent and never rejected: the
    /// message only originates from a proposer that reached accept majority.
    pub(crate) fn decided(
        &mut self,
        seq: Seq,
        n: Proposal,
        value: V,
    ) -> (PeerReply<V>, Option<Instance<V>>) {
        self.observe_seq(seq);
        let done = self.done[self.me];
        let inst = self.instances.entry(seq).or_default();
        *inst = Instance {
            n_p: n,
            n_a: n,
            v_a: Some(value),
            decided: true,
        };
        (
            PeerReply::Decided {
                reject: false,
                done,
            },
            Some(inst.clone()),
        )
    }
}

/// Serializes one acceptor request against the peer state, making the
/// mutated record durable before the reply leaves. Shared verbatim by the
/// network path and the proposer's local self-dispatch.
pub(crate) async fn handle_request<V: PaxosValue>(
    state: &Mutex<PeerState<V>>,
    storage_dir: Option<&Path>,
    req: PeerRequest<V>,
) -> PeerReply<V> {
    let mut guard = state.lock().await;
    let me = guard.me;
    let (seq, (reply, changed)) = match req {
        PeerRequest::Prepare { seq, n } => (seq, guard.prepare(seq, n)),
        PeerRequest::Accept { seq, n, value } => {
            (seq, guard.accept(seq, n, value))
        }
        PeerRequest::Decided { seq, n, value } => {
            (seq, guard.decided(seq, n, value))
        }
    };
    if let (Some(dir), Some(inst)) = (storage_dir, changed) {
        // an instance record that cannot be made durable must never be
        // acknowledged; continuing would risk un-promising after a restart
        if let Err(e) = durability::save(dir, seq, &inst).await {
            pf_error!(me; "durable save of instance {} failed: {}", seq, e);
            std::process::exit(1);
        }
    }
    reply
}

/// A Paxos peer participating in consensus on a shared log of instances.
pub struct PaxosPeer<V: PaxosValue> {
    /// Ordered addresses of all peers; my own entry is the bind address.
    peers: Vec<SocketAddr>,

    /// My index into `peers`.
    me: usize,

    /// Majority quorum size.
    majority: usize,

    /// Per-RPC timeout.
    call_timeout: Duration,

    /// Durable storage directory, if persistence is enabled.
    storage_dir: Option<PathBuf>,

    /// Shared mutable state.
    state: Arc<Mutex<PeerState<V>>>,

    /// Termination signal sender; flipping it stops every task.
    tx_term: watch::Sender<bool>,

    /// Prototype termination receiver handed to spawned proposers.
    rx_term: watch::Receiver<bool>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,

    /// Join handle of the garbage collector task.
    _gc_handle: JoinHandle<()>,
}

impl<V: PaxosValue> PaxosPeer<V> {
    /// Creates a Paxos peer: binds my endpoint, reloads any durable instance
    /// records, and spawns the acceptor and garbage collector tasks.
    pub async fn new_and_setup(
        peers: Vec<SocketAddr>,
        me: usize,
        config: PaxosConfig,
    ) -> Result<Self, SynodError> {
        if me >= peers.len() {
            return logged_err!(me; "invalid peer index {} / {}", me, peers.len());
        }

        let storage_dir = if config.storage_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.storage_dir))
        };

        let mut instances = HashMap::new();
        if let Some(dir) = &storage_dir {
            tokio::fs::create_dir_all(dir).await?;
            instances = durability::load_all(dir).await?;
            if !instances.is_empty() {
                pf_info!(me; "reloaded {} durable instance records",
                             instances.len());
            }
        }
        let nseq = instances.keys().copied().max().unwrap_or(-1);

        let state = Arc::new(Mutex::new(PeerState {
            me,
            instances,
            done: vec![-1; peers.len()],
            nseq,
        }));
        let (tx_term, rx_term) = watch::channel(false);

        let majority = peers_majority(peers.len());
        let listener = rpc::tcp_bind(peers[me]).await?;
        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            me,
            listener,
            state.clone(),
            storage_dir.clone(),
            rx_term.clone(),
        ));
        let gc_handle = tokio::spawn(Self::gc_task(
            me,
            state.clone(),
            storage_dir.clone(),
            Duration::from_millis(config.gc_interval_ms),
            rx_term.clone(),
        ));

        Ok(PaxosPeer {
            peers,
            me,
            majority,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            storage_dir,
            state,
            tx_term,
            rx_term,
            _acceptor_handle: acceptor_handle,
            _gc_handle: gc_handle,
        })
    }

    /// Initiates agreement on `seq` with candidate `value`. Non-blocking: a
    /// proposer task runs the phases asynchronously. A no-op for sequences
    /// already below `min()`.
    pub async fn start(&self, seq: Seq, value: V) {
        if seq < 0 {
            return;
        }
        {
            let mut guard = self.state.lock().await;
            if seq < guard.min() {
                return;
            }
            guard.observe_seq(seq);
        }
        let ctx = ProposerCtx {
            peers: self.peers.clone(),
            me: self.me,
            majority: self.majority,
            call_timeout: self.call_timeout,
            storage_dir: self.storage_dir.clone(),
            state: self.state.clone(),
            rx_term: self.rx_term.clone(),
        };
        tokio::spawn(proposer::propose(ctx, seq, value));
    }

    /// Purely local decision lookup; never contacts other peers.
    pub async fn status(&self, seq: Seq) -> (bool, Option<V>) {
        let mut guard = self.state.lock().await;
        guard.observe_seq(seq);
        match guard.instances.get(&seq) {
            Some(inst) if inst.decided => (true, inst.v_a.clone()),
            _ => (false, None),
        }
    }

    /// Declares that this application will never query instances `<= seq`
    /// again. Monotonic: lower values than already recorded are ignored.
    pub async fn done(&self, seq: Seq) {
        let mut guard = self.state.lock().await;
        let me = guard.me;
        if seq > guard.done[me] {
            guard.done[me] = seq;
        }
    }

    /// Largest sequence number ever seen by this peer (-1 if none).
    pub async fn max(&self) -> Seq {
        self.state.lock().await.nseq
    }

    /// One greater than the minimum exchanged `done` sequence; everything
    /// below has been (or is about to be) forgotten.
    pub async fn min(&self) -> Seq {
        self.state.lock().await.min()
    }

    /// Requests shutdown of the acceptor, garbage collector, and any
    /// outstanding proposer tasks.
    pub fn kill(&self) {
        let _ = self.tx_term.send(true);
    }
}

// PaxosPeer acceptor & GC task implementations
impl<V: PaxosValue> PaxosPeer<V> {
    /// Acceptor task: accepts peer connections until killed, one servant
    /// task per connection.
    async fn acceptor_task(
        me: usize,
        listener: TcpListener,
        state: Arc<Mutex<PeerState<V>>>,
        storage_dir: Option<PathBuf>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "acceptor task spawned");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tokio::spawn(Self::connection_task(
                                stream,
                                state.clone(),
                                storage_dir.clone(),
                                rx_term.clone(),
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
        pf_debug!(me; "acceptor task exited");
    }

    /// Serves one peer connection: a loop of request frames answered by
    /// reply frames, until the connection drops or the peer is killed.
    async fn connection_task(
        stream: TcpStream,
        state: Arc<Mutex<PeerState<V>>>,
        storage_dir: Option<PathBuf>,
        rx_term: watch::Receiver<bool>,
    ) {
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let (mut conn_read, mut conn_write) = stream.into_split();
        loop {
            let req: PeerRequest<V> =
                match rpc::recv_framed(&mut read_buf, &mut conn_read).await {
                    Ok(req) => req,
                    Err(_) => return,
                };
            if *rx_term.borrow() {
                return;
            }
            let reply =
                handle_request(&state, storage_dir.as_deref(), req).await;
            if rpc::send_framed(&mut conn_write, &reply).await.is_err() {
                return;
            }
        }
    }

    /// Garbage collector task: periodically forgets every instance below
    /// `min()`, deleting durable record files along the way.
    async fn gc_task(
        me: usize,
        state: Arc<Mutex<PeerState<V>>>,
        storage_dir: Option<PathBuf>,
        gc_interval: Duration,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "gc task spawned");
        let mut interval = time::interval(gc_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut guard = state.lock().await;
                    let min = guard.min();
                    let stale: Vec<Seq> = guard
                        .instances
                        .keys()
                        .filter(|&&seq| seq < min)
                        .copied()
                        .collect();
                    for seq in stale {
                        guard.instances.remove(&seq);
                        if let Some(dir) = &storage_dir {
                            if let Err(e) = durability::remove(dir, seq).await {
                                pf_warn!(me; "error removing record {}: {}",
                                             seq, e);
                            }
                        }
                        pf_trace!(me; "forgot instance {}", seq);
                    }
                },
                _ = rx_term.changed() => break,
            }
        }
        pf_debug!(me; "gc task exited");
    }
}

/// Majority quorum size for a peer set of `population`.
#[inline]
fn peers_majority(population: usize) -> usize {
    population / 2 + 1
}

#[cfg(test)]
mod peer_tests {
    use super::*;

    fn new_state(population: usize) -> PeerState<String> {
        PeerState {
            me: 0,
            instances: HashMap::new(),
            done: vec![-1; population],
            nseq: -1,
        }
    }

    #[test]
    fn prepare_promises_and_rejects() {
        let mut state = new_state(3);
        let (reply, changed) = state.prepare(0, 3);
        assert!(matches!(
            reply,
            PeerReply::Prepare {
                n_a: -1,
                v_a: None,
                reject: false,
                done: -1
            }
        ));
        assert_eq!(changed.unwrap().n_p, 3);

        // equal or lower proposal numbers are refused
        let (reply, changed) = state.prepare(0, 3);
        assert!(matches!(reply, PeerReply::Prepare { reject: true, .. }));
        assert!(changed.is_none());

        let (reply, _) = state.prepare(0, 5);
        assert!(matches!(reply, PeerReply::Prepare { reject: false, .. }));
        assert_eq!(state.instances[&0].n_p, 5);
    }

    #[test]
    fn accept_requires_promise() {
        let mut state = new_state(3);
        state.prepare(0, 5);
        let (reply, _) = state.accept(0, 4, "low".into());
        assert!(matches!(reply, PeerReply::Accept { reject: true, .. }));
        assert_eq!(state.instances[&0].n_a, -1);

        let (reply, changed) = state.accept(0, 5, "kept".into());
        assert!(matches!(reply, PeerReply::Accept { reject: false, .. }));
        let inst = changed.unwrap();
        assert_eq!(inst.n_a, 5);
        assert_eq!(inst.v_a.as_deref(), Some("kept"));

        // a later prepare reports the accepted pair back
        let (reply, _) = state.prepare(0, 8);
        match reply {
            PeerReply::Prepare { n_a, v_a, reject, .. } => {
                assert!(!reject);
                assert_eq!(n_a, 5);
                assert_eq!(v_a.as_deref(), Some("kept"));
            }
            _ => panic!("wrong reply kind"),
        }
    }

    #[test]
    fn decided_is_terminal_and_idempotent() {
        let mut state = new_state(5);
        state.decided(2, 1, "final".into());
        assert!(state.instances[&2].decided);
        assert_eq!(state.instances[&2].v_a.as_deref(), Some("final"));

        // replaying the decision changes nothing observable
        let (reply, _) = state.decided(2, 1, "final".into());
        assert!(matches!(reply, PeerReply::Decided { reject: false, .. }));
        assert_eq!(state.instances[&2].v_a.as_deref(), Some("final"));

        // a prepare on a decided instance still answers with the value
        let (reply, _) = state.prepare(2, 9);
        match reply {
            PeerReply::Prepare { v_a, .. } => {
                assert_eq!(v_a.as_deref(), Some("final"))
            }
            _ => panic!("wrong reply kind"),
        }
    }

    #[test]
    fn done_piggyback_and_min() {
        let mut state = new_state(3);
        assert_eq!(state.min(), 0);
        state.done[0] = 4;
        let (reply, _) = state.prepare(9, 0);
        assert!(matches!(reply, PeerReply::Prepare { done: 4, .. }));

        // min is gated on the slowest peer
        assert_eq!(state.min(), 0);
        state.done[1] = 2;
        state.done[2] = 7;
        assert_eq!(state.min(), 3);
    }

    #[test]
    fn nseq_tracks_touches() {
        let mut state = new_state(3);
        state.prepare(6, 0);
        assert_eq!(state.nseq, 6);
        state.accept(2, 0, "v".into());
        assert_eq!(state.nseq, 6);
        state.decided(10, 0, "v".into());
        assert_eq!(state.nseq, 10);
    }

    #[test]
    fn majority_sizes() {
        assert_eq!(peers_majority(1), 1);
        assert_eq!(peers_majority(3), 2);
        assert_eq!(peers_majority(4), 3);
        assert_eq!(peers_majority(5), 3);
    }
}
