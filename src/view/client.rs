//! Client stub for the view service.

use std::net::SocketAddr;

use tokio::time::Duration;

use crate::utils::{rpc, SynodError};
use crate::view::{View, ViewRequest};

/// Per-RPC timeout towards the view service.
const CALL_TIMEOUT: Duration = Duration::from_millis(500);

/// View service client stub, used by servers (ping) and clients (get).
pub struct ViewClient {
    /// My identity as reported in pings; servers use their own address.
    me: String,

    /// Address of the view service.
    server: SocketAddr,
}

impl ViewClient {
    pub fn new(me: impl Into<String>, server: SocketAddr) -> Self {
        ViewClient {
            me: me.into(),
            server,
        }
    }

    /// Reports liveness along with the view number currently adopted
    /// (0 right after a start or restart); returns the current view.
    pub async fn ping(&self, viewnum: u64) -> Result<View, SynodError> {
        rpc::call(
            self.server,
            &ViewRequest::Ping {
                me: self.me.clone(),
                viewnum,
            },
            CALL_TIMEOUT,
        )
        .await
    }

    /// Fetches the current view without affecting liveness tracking.
    pub async fn get(&self) -> Result<View, SynodError> {
        rpc::call(self.server, &ViewRequest::Get, CALL_TIMEOUT).await
    }
}
