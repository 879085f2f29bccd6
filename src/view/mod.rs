//! View service: elects a primary and backup among live servers.
//!
//! A single non-replicated process that every primary/backup KV server
//! pings at a fixed interval. Views are numbered and append-only; a new
//! view may be installed only after the current primary has acknowledged
//! the current one, which is what keeps two primaries from ever serving at
//! the same real time.

mod client;
mod server;

pub use client::ViewClient;
pub use server::ViewServer;

use serde::{Deserialize, Serialize};

/// A numbered assignment of the primary and backup roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Sequential view number; 0 means no view has been installed yet.
    pub viewnum: u64,

    /// Address of the primary server.
    pub primary: Option<String>,

    /// Address of the backup server, if any.
    pub backup: Option<String>,
}

impl View {
    /// The pre-bootstrap view, number 0 with no roles assigned.
    pub fn empty() -> Self {
        View {
            viewnum: 0,
            primary: None,
            backup: None,
        }
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    /// Tick interval in millisecs; servers are expected to ping once per
    /// interval.
    pub ping_interval_ms: u64,

    /// Number of ticks without a ping after which a server counts as dead.
    pub dead_pings: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ViewConfig {
    fn default() -> Self {
        ViewConfig {
            ping_interval_ms: 100,
            dead_pings: 5,
        }
    }
}

/// Requests accepted by the view service. Both are answered with the
/// current [`View`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ViewRequest {
    /// Liveness report from a server, carrying the view number it has
    /// adopted (0 signals a fresh start or restart).
    Ping { me: String, viewnum: u64 },

    /// Read-only view fetch; does not update liveness tracking.
    Get,
}
