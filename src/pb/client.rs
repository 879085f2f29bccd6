//! Client stub for the primary/backup KV service.

use std::net::SocketAddr;

use tokio::time::{self, Duration};

use crate::pb::{
    ErrKind, GetArgs, PbReply, PbRequest, PutArgs,
};
use crate::utils::{rpc, SynodError};
use crate::view::{View, ViewClient};

/// Per-RPC timeout towards the primary.
const CALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between retries, matching the view service ping cadence.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Primary/backup KV client. Caches the latest view and retries through
/// view changes with stable operation ids, so a committed operation always
/// resolves to the same reply.
pub struct PbClient {
    vs: ViewClient,

    /// Client identity nonce scoping the dedupe logs.
    client: u64,

    /// Cached view; refreshed whenever the primary stops answering.
    view: View,
}

impl PbClient {
    pub fn new(view_addr: SocketAddr) -> Self {
        PbClient {
            vs: ViewClient::new("", view_addr),
            client: rand::random(),
            view: View::empty(),
        }
    }

    async fn refresh_view(&mut self) {
        if let Ok(view) = self.vs.get().await {
            self.view = view;
        }
    }

    fn primary_addr(&self) -> Option<SocketAddr> {
        self.view.primary.as_ref().and_then(|p| p.parse().ok())
    }

    /// Fetches the value under `key`; an absent key reads as the empty
    /// string. Retries indefinitely across primary failures.
    pub async fn get(&mut self, key: &str) -> String {
        let args = GetArgs {
            key: key.into(),
            client: self.client,
            op_id: rand::random(),
        };
        if self.view.viewnum == 0 {
            self.refresh_view().await;
        }
        loop {
            if let Some(primary) = self.primary_addr() {
                let result: Result<PbReply, SynodError> =
                    rpc::call(primary, &PbRequest::Get(args.clone()), CALL_TIMEOUT)
                        .await;
                if let Ok(PbReply::Get(reply)) = result {
                    match reply.err {
                        ErrKind::Ok => return reply.value,
                        ErrKind::NoKey => return String::new(),
                        _ => {}
                    }
                }
            }
            time::sleep(RETRY_INTERVAL).await;
            self.refresh_view().await;
        }
    }

    /// Stores `value` under `key`.
    pub async fn put(&mut self, key: &str, value: &str) {
        self.put_ext(key, value, false).await;
    }

    /// Hashing put: the stored value becomes `fnv1a(previous ++ value)` as
    /// a decimal string; returns the previous value.
    pub async fn put_hash(&mut self, key: &str, value: &str) -> String {
        self.put_ext(key, value, true).await
    }

    async fn put_ext(&mut self, key: &str, value: &str, do_hash: bool) -> String {
        let args = PutArgs {
            key: key.into(),
            value: value.into(),
            do_hash,
            client: self.client,
            op_id: rand::random(),
        };
        if self.view.viewnum == 0 {
            self.refresh_view().await;
        }
        loop {
            if let Some(primary) = self.primary_addr() {
                let result: Result<PbReply, SynodError> =
                    rpc::call(primary, &PbRequest::Put(args.clone()), CALL_TIMEOUT)
                        .await;
                if let Ok(PbReply::Put(reply)) = result {
                    if reply.err == ErrKind::Ok {
                        return reply.previous_value;
                    }
                }
            }
            time::sleep(RETRY_INTERVAL).await;
            self.refresh_view().await;
        }
    }
}
