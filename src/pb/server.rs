//! Primary/backup KV server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::pb::{
    ErrKind, GetArgs, GetEntry, GetReply, PbConfig, PbReply, PbRequest,
    PutArgs, PutEntry, PutReply,
};
use crate::utils::{fnv1a, rpc, SynodError};
use crate::view::{View, ViewClient};

/// Mutable server state, guarded by the single server mutex. The mutex is
/// held across forwards to the backup so that an operation commits (or
/// fails) as one unit.
struct PbState {
    /// Current view as adopted by this server.
    view: View,

    /// The replicated map.
    store: HashMap<String, String>,

    /// Dedupe log of completed Gets, keyed by operation id.
    gets: HashMap<u64, GetEntry>,

    /// Dedupe log of completed Puts, keyed by operation id.
    puts: HashMap<u64, PutEntry>,
}

/// A primary/backup KV server; its role at any moment is dictated by the
/// view service.
pub struct PbServer {
    /// My identity, the address string registered with the view service.
    me: String,

    state: Arc<Mutex<PbState>>,

    /// Termination signal sender.
    tx_term: watch::Sender<bool>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,

    /// Join handle of the view ping tick task.
    _tick_handle: JoinHandle<()>,
}

impl PbServer {
    /// Creates a primary/backup server listening on `addr`, pinging the
    /// view service at `view_addr`.
    pub async fn new_and_setup(
        addr: SocketAddr,
        view_addr: SocketAddr,
        config: PbConfig,
    ) -> Result<Self, SynodError> {
        let me = addr.to_string();
        if config.ping_interval_ms == 0 {
            return logged_err!(me; "invalid config.ping_interval_ms '{}'",
                                   config.ping_interval_ms);
        }

        let state = Arc::new(Mutex::new(PbState {
            view: View::empty(),
            store: HashMap::new(),
            gets: HashMap::new(),
            puts: HashMap::new(),
        }));
        let (tx_term, rx_term) = watch::channel(false);
        let call_timeout = Duration::from_millis(config.call_timeout_ms);

        let listener = rpc::tcp_bind(addr).await?;
        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            me.clone(),
            listener,
            state.clone(),
            call_timeout,
            rx_term.clone(),
        ));
        let tick_handle = tokio::spawn(Self::tick_task(
            me.clone(),
            ViewClient::new(me.clone(), view_addr),
            state.clone(),
            Duration::from_millis(config.ping_interval_ms),
            call_timeout,
            rx_term,
        ));

        Ok(PbServer {
            me,
            state,
            tx_term,
            _acceptor_handle: acceptor_handle,
            _tick_handle: tick_handle,
        })
    }

    /// My identity string as known to the view service.
    pub fn identity(&self) -> &str {
        &self.me
    }

    /// Requests shutdown of the acceptor and tick tasks. The server stops
    /// pinging, so the view service will see it die.
    pub fn kill(&self) {
        let _ = self.tx_term.send(true);
    }
}

// PbServer request handling
impl PbServer {
    async fn acceptor_task(
        me: String,
        listener: TcpListener,
        state: Arc<Mutex<PbState>>,
        call_timeout: Duration,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "acceptor task spawned");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tokio::spawn(Self::connection_task(
                                me.clone(),
                                stream,
                                state.clone(),
                                call_timeout,
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

    async fn connection_task(
        me: String,
        stream: TcpStream,
        state: Arc<Mutex<PbState>>,
        call_timeout: Duration,
    ) {
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let (mut conn_read, mut conn_write) = stream.into_split();
        loop {
            let req: PbRequest =
                match rpc::recv_framed(&mut read_buf, &mut conn_read).await {
                    Ok(req) => req,
                    Err(_) => return,
                };
            let reply = match req {
                PbRequest::Get(args) => PbReply::Get(
                    Self::handle_get(&me, &state, call_timeout, args).await,
                ),
                PbRequest::Put(args) => PbReply::Put(
                    Self::handle_put(&me, &state, call_timeout, args).await,
                ),
                PbRequest::ForwardGet { args, reply } => PbReply::Forward {
                    err: Self::handle_forward_get(&me, &state, args, reply)
                        .await,
                },
                PbRequest::ForwardPut { args, reply } => PbReply::Forward {
                    err: Self::handle_forward_put(&me, &state, args, reply)
                        .await,
                },
                PbRequest::ForwardState {
                    store, gets, puts, ..
                } => PbReply::Forward {
                    err: Self::handle_forward_state(
                        &me, &state, store, gets, puts,
                    )
                    .await,
                },
            };
            if rpc::send_framed(&mut conn_write, &reply).await.is_err() {
                return;
            }
        }
    }

    /// Primary-side Get: dedupe, read, forward the completed reply, commit.
    async fn handle_get(
        me: &str,
        state: &Mutex<PbState>,
        call_timeout: Duration,
        args: GetArgs,
    ) -> GetReply {
        let mut guard = state.lock().await;

        if guard.view.primary.as_deref() != Some(me) {
            return GetReply {
                err: ErrKind::WrongServer,
                value: String::new(),
            };
        }

        if let Some(entry) = guard.gets.get(&args.op_id) {
            if entry.client == args.client {
                return entry.reply.clone();
            }
        }

        let reply = match guard.store.get(&args.key) {
            Some(value) => GetReply {
                err: ErrKind::Ok,
                value: value.clone(),
            },
            None => GetReply {
                err: ErrKind::NoKey,
                value: String::new(),
            },
        };

        if let Some(backup) = guard.view.backup.clone() {
            let fwd = PbRequest::ForwardGet {
                args: args.clone(),
                reply: reply.clone(),
            };
            if !forward_ok(&backup, &fwd, call_timeout).await {
                return GetReply {
                    err: ErrKind::Backup,
                    value: String::new(),
                };
            }
        }

        guard.gets.insert(
            args.op_id,
            GetEntry {
                reply: reply.clone(),
                client: args.client,
            },
        );
        reply
    }

    /// Primary-side Put: dedupe, compute the stored value (hashing variant
    /// reads the previous value first), forward, then commit.
    async fn handle_put(
        me: &str,
        state: &Mutex<PbState>,
        call_timeout: Duration,
        mut args: PutArgs,
    ) -> PutReply {
        let mut guard = state.lock().await;

        if guard.view.primary.as_deref() != Some(me) {
            return PutReply {
                err: ErrKind::WrongServer,
                previous_value: String::new(),
            };
        }

        if let Some(entry) = guard.puts.get(&args.op_id) {
            if entry.client == args.client {
                return entry.reply.clone();
            }
        }

        let mut reply = PutReply {
            err: ErrKind::Ok,
            previous_value: String::new(),
        };
        if args.do_hash {
            let previous =
                guard.store.get(&args.key).cloned().unwrap_or_default();
            // the forwarded args carry the already-hashed value so that the
            // backup replays exactly what the primary commits
            args.value =
                fnv1a(&format!("{}{}", previous, args.value)).to_string();
            reply.previous_value = previous;
        }

        if let Some(backup) = guard.view.backup.clone() {
            let fwd = PbRequest::ForwardPut {
                args: args.clone(),
                reply: reply.clone(),
            };
            if !forward_ok(&backup, &fwd, call_timeout).await {
                return PutReply {
                    err: ErrKind::Backup,
                    previous_value: String::new(),
                };
            }
        }

        guard.puts.insert(
            args.op_id,
            PutEntry {
                reply: reply.clone(),
                client: args.client,
            },
        );
        guard.store.insert(args.key, args.value);
        reply
    }

    /// Backup-side Put replay: store the forwarded value and log the reply.
    async fn handle_forward_put(
        me: &str,
        state: &Mutex<PbState>,
        args: PutArgs,
        reply: PutReply,
    ) -> ErrKind {
        let mut guard = state.lock().await;
        if guard.view.backup.as_deref() != Some(me) {
            return ErrKind::WrongServer;
        }
        guard.puts.insert(
            args.op_id,
            PutEntry {
                reply,
                client: args.client,
            },
        );
        guard.store.insert(args.key, args.value);
        ErrKind::Ok
    }

    /// Backup-side Get logging: no store mutation, only the dedupe record.
    async fn handle_forward_get(
        me: &str,
        state: &Mutex<PbState>,
        args: GetArgs,
        reply: GetReply,
    ) -> ErrKind {
        let mut guard = state.lock().await;
        if guard.view.backup.as_deref() != Some(me) {
            return ErrKind::WrongServer;
        }
        guard.gets.insert(
            args.op_id,
            GetEntry {
                reply,
                client: args.client,
            },
        );
        ErrKind::Ok
    }

    /// Backup-side full state transfer from the primary.
    async fn handle_forward_state(
        me: &str,
        state: &Mutex<PbState>,
        store: HashMap<String, String>,
        gets: HashMap<u64, GetEntry>,
        puts: HashMap<u64, PutEntry>,
    ) -> ErrKind {
        let mut guard = state.lock().await;
        if guard.view.backup.as_deref() != Some(me) {
            return ErrKind::WrongServer;
        }
        pf_info!(me; "installing transferred state ({} keys)", store.len());
        guard.store = store;
        guard.gets = gets;
        guard.puts = puts;
        ErrKind::Ok
    }

    /// Tick task: pings the view service once per interval and adopts view
    /// changes. A new primary hands its full state to a newly appointed
    /// backup before adopting; if that transfer fails it keeps the old view
    /// and retries on the next tick.
    async fn tick_task(
        me: String,
        view_client: ViewClient,
        state: Arc<Mutex<PbState>>,
        ping_interval: Duration,
        call_timeout: Duration,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "tick task spawned");
        let mut interval = time::interval(ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut guard = state.lock().await;
                    let Ok(view) = view_client.ping(guard.view.viewnum).await
                    else {
                        continue;
                    };

                    if view.primary.as_deref() == Some(me.as_str())
                        && view.viewnum != guard.view.viewnum
                        && view.backup != guard.view.backup
                    {
                        if let Some(backup) = view.backup.clone() {
                            let fwd = PbRequest::ForwardState {
                                primary: me.clone(),
                                store: guard.store.clone(),
                                gets: guard.gets.clone(),
                                puts: guard.puts.clone(),
                            };
                            if !forward_ok(&backup, &fwd, call_timeout).await {
                                pf_warn!(me; "state transfer to '{}' failed; \
                                              retrying", backup);
                                continue;
                            }
                        }
                    }

                    if view.viewnum != guard.view.viewnum {
                        pf_info!(me; "adopting view {} (primary '{:?}', \
                                      backup '{:?}')",
                                     view.viewnum, view.primary, view.backup);
                    }
                    guard.view = view;
                },
                _ = rx_term.changed() => break,
            }
        }
        pf_debug!(me; "tick task exited");
    }
}

/// Sends a forward request to the backup at `addr`; any transport failure
/// or non-OK status counts as a failed forward.
async fn forward_ok(
    addr: &str,
    req: &PbRequest,
    call_timeout: Duration,
) -> bool {
    let Ok(addr) = addr.parse::<SocketAddr>() else {
        return false;
    };
    matches!(
        rpc::call::<_, PbReply>(addr, req, call_timeout).await,
        Ok(PbReply::Forward { err: ErrKind::Ok })
    )
}
