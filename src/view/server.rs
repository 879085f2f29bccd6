//! View service server: ping bookkeeping and the view transition rules.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::utils::{rpc, SynodError};
use crate::view::{View, ViewConfig, ViewRequest};

/// Mutable view service state, guarded by the single service mutex. All
/// transition logic lives here as pure methods so it can be exercised
/// without a network.
pub(crate) struct ViewState {
    /// Ticks elapsed since startup.
    ticks: u64,

    /// Last tick at which each server pinged.
    pings: HashMap<String, u64>,

    /// Current view; never mutated in place, only replaced by `transition`.
    current: View,

    /// Whether the current primary has pinged with the current view number.
    ack: bool,

    /// Missed-tick threshold for declaring a server dead.
    dead_pings: u64,
}

impl ViewState {
    pub(crate) fn new(dead_pings: u64) -> Self {
        ViewState {
            ticks: 0,
            pings: HashMap::new(),
            current: View::empty(),
            ack: false,
            dead_pings,
        }
    }

    fn live(&self, server: &str) -> bool {
        self.pings
            .get(server)
            .is_some_and(|&tick| self.ticks - tick <= self.dead_pings)
    }

    /// First live server holding neither role. Picked in address order so a
    /// single invocation is deterministic.
    fn idle_server(&self) -> Option<String> {
        self.pings
            .iter()
            .filter(|&(_, &tick)| self.ticks - tick <= self.dead_pings)
            .map(|(server, _)| server)
            .filter(|&server| {
                self.current.primary.as_deref() != Some(server.as_str())
                    && self.current.backup.as_deref() != Some(server.as_str())
            })
            .min()
            .cloned()
    }

    /// Installs the successor view. Only reachable when the current view
    /// has been acknowledged.
    fn transition(&mut self, primary: Option<String>, backup: Option<String>) {
        self.current = View {
            viewnum: self.current.viewnum + 1,
            primary,
            backup,
        };
        self.ack = false;
    }

    /// Records a ping from `me` and evaluates the transition triggers.
    /// Returns the (possibly new) current view.
    pub(crate) fn handle_ping(&mut self, me: String, viewnum: u64) -> View {
        // bootstrap: the very first server to ping becomes primary of view 1
        if self.current.viewnum == 0 {
            self.pings.insert(me.clone(), self.ticks);
            self.current = View {
                viewnum: 1,
                primary: Some(me),
                backup: None,
            };
            self.ack = false;
            return self.current.clone();
        }

        self.pings.insert(me.clone(), self.ticks);

        if self.current.primary.as_deref() == Some(me.as_str()) {
            if viewnum == self.current.viewnum {
                self.ack = true;
            } else if viewnum == 0 && self.ack {
                // restart detected: promote the backup. Without an ack the
                // service stays put, even if that wedges it for good.
                let idle = self.idle_server();
                let backup = self.current.backup.clone();
                self.transition(backup, idle);
            }
        } else if self.current.backup.as_deref() == Some(me.as_str()) {
            if viewnum == 0 && self.ack {
                let idle = self.idle_server();
                let primary = self.current.primary.clone();
                self.transition(primary, idle);
            }
        } else if self.current.backup.is_none() && self.ack {
            // an idle server fills the empty backup slot
            let primary = self.current.primary.clone();
            self.transition(primary, Some(me));
        }

        self.current.clone()
    }

    /// Read-only view fetch for clients.
    pub(crate) fn handle_get(&self) -> View {
        self.current.clone()
    }

    /// Advances the tick clock and evaluates the failure triggers.
    pub(crate) fn tick(&mut self) {
        self.ticks += 1;

        if self.current.viewnum == 0 || !self.ack {
            return;
        }

        if let Some(primary) = self.current.primary.clone() {
            if !self.live(&primary) {
                self.pings.remove(&primary);
                let idle = self.idle_server();
                let backup = self.current.backup.clone();
                self.transition(backup, idle);
                return;
            }
        }

        if let Some(backup) = self.current.backup.clone() {
            if !self.live(&backup) {
                self.pings.remove(&backup);
                let idle = self.idle_server();
                let primary = self.current.primary.clone();
                self.transition(primary, idle);
            }
        } else if let Some(idle) = self.idle_server() {
            let primary = self.current.primary.clone();
            self.transition(primary, Some(idle));
        }
    }
}

/// The view service process.
pub struct ViewServer {
    state: Arc<Mutex<ViewState>>,

    /// Termination signal sender.
    tx_term: watch::Sender<bool>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,

    /// Join handle of the tick task.
    _tick_handle: JoinHandle<()>,
}

impl ViewServer {
    /// Creates a view server listening on `addr` and spawns the acceptor
    /// and tick tasks.
    pub async fn new_and_setup(
        addr: SocketAddr,
        config: ViewConfig,
    ) -> Result<Self, SynodError> {
        if config.ping_interval_ms == 0 {
            return logged_err!("view"; "invalid config.ping_interval_ms '{}'",
                                       config.ping_interval_ms);
        }
        if config.dead_pings == 0 {
            return logged_err!("view"; "invalid config.dead_pings '{}'",
                                       config.dead_pings);
        }

        let state = Arc::new(Mutex::new(ViewState::new(config.dead_pings)));
        let (tx_term, rx_term) = watch::channel(false);

        let listener = rpc::tcp_bind(addr).await?;
        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            listener,
            state.clone(),
            rx_term.clone(),
        ));
        let tick_handle = tokio::spawn(Self::tick_task(
            state.clone(),
            Duration::from_millis(config.ping_interval_ms),
            rx_term,
        ));

        Ok(ViewServer {
            state,
            tx_term,
            _acceptor_handle: acceptor_handle,
            _tick_handle: tick_handle,
        })
    }

    /// Snapshot of the current view, for tests and operators.
    pub async fn current_view(&self) -> View {
        self.state.lock().await.handle_get()
    }

    /// Requests shutdown of the acceptor and tick tasks.
    pub fn kill(&self) {
        let _ = self.tx_term.send(true);
    }

    async fn acceptor_task(
        listener: TcpListener,
        state: Arc<Mutex<ViewState>>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!("view"; "acceptor task spawned");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tokio::spawn(Self::connection_task(
                                stream,
                                state.clone(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!("view"; "error accepting connection: {}",
                                             e);
                        }
                    }
                },
                _ = rx_term.changed() => break,
            }
        }
        pf_debug!("view"; "acceptor task exited");
    }

    async fn connection_task(stream: TcpStream, state: Arc<Mutex<ViewState>>) {
        let mut read_buf = BytesMut::with_capacity(1024);
        let (mut conn_read, mut conn_write) = stream.into_split();
        loop {
            let req: ViewRequest =
                match rpc::recv_framed(&mut read_buf, &mut conn_read).await {
                    Ok(req) => req,
                    Err(_) => return,
                };
            let view = {
                let mut guard = state.lock().await;
                match req {
                    ViewRequest::Ping { me, viewnum } => {
                        guard.handle_ping(me, viewnum)
                    }
                    ViewRequest::Get => guard.handle_get(),
                }
            };
            if rpc::send_framed(&mut conn_write, &view).await.is_err() {
                return;
            }
        }
    }

    async fn tick_task(
        state: Arc<Mutex<ViewState>>,
        ping_interval: Duration,
        mut rx_term: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    state.lock().await.tick();
                },
                _ = rx_term.changed() => break,
            }
        }
        pf_debug!("view"; "tick task exited");
    }
}

#[cfg(test)]
mod view_tests {
    use super::*;

    fn view(
        viewnum: u64,
        primary: Option<&str>,
        backup: Option<&str>,
    ) -> View {
        View {
            viewnum,
            primary: primary.map(String::from),
            backup: backup.map(String::from),
        }
    }

    #[test]
    fn bootstrap_first_pinger_wins() {
        let mut state = ViewState::new(5);
        let got = state.handle_ping("a".into(), 0);
        assert_eq!(got, view(1, Some("a"), None));

        // second server only becomes backup after the primary acks
        let got = state.handle_ping("b".into(), 0);
        assert_eq!(got, view(1, Some("a"), None));
        state.handle_ping("a".into(), 1);
        let got = state.handle_ping("b".into(), 0);
        assert_eq!(got, view(2, Some("a"), Some("b")));
    }

    #[test]
    fn primary_death_promotes_backup() {
        let mut state = ViewState::new(2);
        state.handle_ping("a".into(), 0);
        state.handle_ping("a".into(), 1);
        state.handle_ping("b".into(), 0);
        state.handle_ping("a".into(), 2);

        // b keeps pinging; a goes silent past the threshold
        for _ in 0..4 {
            state.tick();
            state.handle_ping("b".into(), 2);
        }
        state.tick();
        assert_eq!(state.current, view(3, Some("b"), None));
    }

    #[test]
    fn idle_server_fills_backup_on_tick() {
        let mut state = ViewState::new(2);
        state.handle_ping("a".into(), 0);
        state.handle_ping("a".into(), 1);
        state.handle_ping("c".into(), 0);
        assert_eq!(state.current, view(2, Some("a"), Some("c")));
        state.handle_ping("a".into(), 2);

        // c dies; d is around as idle and gets pulled in on the next tick
        state.handle_ping("d".into(), 0);
        for _ in 0..3 {
            state.tick();
            state.handle_ping("a".into(), state.current.viewnum);
            state.handle_ping("d".into(), state.current.viewnum);
        }
        assert_eq!(state.current.primary.as_deref(), Some("a"));
        assert_eq!(state.current.backup.as_deref(), Some("d"));
    }

    #[test]
    fn restart_before_ack_wedges() {
        let mut state = ViewState::new(5);
        state.handle_ping("a".into(), 0);
        // a restarts without ever acknowledging view 1
        let got = state.handle_ping("a".into(), 0);
        assert_eq!(got.viewnum, 1);
        for _ in 0..20 {
            state.tick();
        }
        assert_eq!(state.current, view(1, Some("a"), None));
    }

    #[test]
    fn primary_restart_after_ack_promotes() {
        let mut state = ViewState::new(5);
        state.handle_ping("a".into(), 0);
        state.handle_ping("a".into(), 1);
        state.handle_ping("b".into(), 0);
        state.handle_ping("a".into(), 2);

        let got = state.handle_ping("a".into(), 0);
        assert_eq!(got, view(3, Some("b"), None));
        // the restarted a is now idle and may return as backup after ack
        let got = state.handle_ping("b".into(), 3);
        assert_eq!(got.viewnum, 3);
        let got = state.handle_ping("a".into(), 0);
        assert_eq!(got, view(4, Some("b"), Some("a")));
    }

    #[test]
    fn successor_primary_comes_from_old_view() {
        let mut state = ViewState::new(2);
        state.handle_ping("a".into(), 0);
        state.handle_ping("a".into(), 1);
        state.handle_ping("b".into(), 0);
        state.handle_ping("c".into(), 0);
        state.handle_ping("a".into(), 2);

        let old = state.current.clone();
        for _ in 0..4 {
            state.tick();
            state.handle_ping("b".into(), old.viewnum);
            state.handle_ping("c".into(), old.viewnum);
        }
        state.tick();
        let promoted = state.current.primary.clone();
        assert!(
            promoted == old.primary || promoted == old.backup,
            "primary {:?} not from old view {:?}",
            promoted,
            old
        );
    }
}
