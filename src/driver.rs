//! Replicated-log driver: runs a deterministic state machine off the Paxos
//! log with at-most-once client semantics.
//!
//! Every server owning a driver funnels client operations through
//! `submit()`: the driver claims a log slot for the operation, fills any
//! holes below it with no-ops so the cluster decides them, applies every
//! decision in sequence order, and answers from a per-client dedupe log on
//! retries. Decisions are awaited by polling with bounded-exponential
//! backoff; network delivery, not local signaling, drives progress.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tokio::time::{self, Duration};

use crate::paxos::{PaxosPeer, PaxosValue, Seq};

/// Initial decision-poll backoff.
const BACKOFF_INIT: Duration = Duration::from_millis(10);

/// Decision-poll backoff cap.
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Dedupe records kept per client once its operations have been applied.
const OPLOG_WINDOW: usize = 8;

/// A log slot value: either a client operation or the distinguished no-op
/// used to force decisions on empty slots during catch-up. Applying a no-op
/// mutates nothing and leaves no dedupe record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum LogEntry<Op> {
    Noop,
    Op(Op),
}

/// Deterministic state machine driven by the replicated log.
pub(crate) trait StateMachine: Send + 'static {
    type Op: PaxosValue;
    type Output: fmt::Debug + Clone + Send + 'static;

    /// Client identity and operation nonce of `op`, the dedupe key.
    fn ids(op: &Self::Op) -> (u64, u64);

    /// Applies `op` to the machine; must be a pure function of the current
    /// machine state and the operation.
    fn apply(&mut self, op: &Self::Op) -> Self::Output;
}

/// Most-recent-result record for one applied client operation.
struct OpRecord<Output> {
    op_id: u64,
    output: Output,
}

/// The log driver; owned by a server and guarded by that server's mutex.
pub(crate) struct LogDriver<M: StateMachine> {
    me: usize,

    machine: M,

    paxos: Arc<PaxosPeer<LogEntry<M::Op>>>,

    /// Per-client applied-operation records, keyed by commit sequence.
    op_log: HashMap<u64, HashMap<Seq, OpRecord<M::Output>>>,

    /// Next sequence number to try proposing on.
    seq_tried: Seq,

    /// Highest sequence number already applied.
    seq_done: Seq,
}

impl<M: StateMachine> LogDriver<M> {
    pub(crate) fn new(
        me: usize,
        machine: M,
        paxos: Arc<PaxosPeer<LogEntry<M::Op>>>,
    ) -> Self {
        LogDriver {
            me,
            machine,
            paxos,
            op_log: HashMap::new(),
            seq_tried: 0,
            seq_done: -1,
        }
    }

    /// Commits `op` into the log exactly once and returns its output. A
    /// retry with the same `(client, op_id)` pair replays the recorded
    /// output without re-executing the operation.
    pub(crate) async fn submit(&mut self, op: M::Op) -> M::Output {
        let (client, op_id) = M::ids(&op);

        // catch up on everything already known, then check for a replay
        self.apply_through(self.seq_tried - 1).await;
        if let Some(output) = self.lookup(client, op_id) {
            return output;
        }

        if let Some(seq) = self.decide_seq(&op).await {
            self.apply_through(seq).await;
        }
        match self.lookup(client, op_id) {
            Some(output) => output,
            None => panic!(
                "({}) output of decided op {:#x} missing from log",
                self.me, op_id
            ),
        }
    }

    /// Claims a log slot for `op`. Returns `Some(seq)` once the cluster has
    /// decided `op` at `seq`, or `None` if catch-up revealed the operation
    /// was already applied earlier (the dedupe record holds its output).
    async fn decide_seq(&mut self, op: &M::Op) -> Option<Seq> {
        let (client, op_id) = M::ids(op);
        loop {
            let seq = self.seq_tried;

            let (decided, value) = self.paxos.status(seq).await;
            if decided {
                self.seq_tried += 1;
                if Self::holds_op(&value, client, op_id) {
                    return Some(seq);
                }
                continue;
            }

            // catch up behind the candidate slot first; the operation may
            // have been committed by another server already
            self.apply_through(seq - 1).await;
            if self.lookup(client, op_id).is_some() {
                return None;
            }

            self.seq_tried += 1;
            self.paxos
                .start(seq, LogEntry::Op(op.clone()))
                .await;
            self.wait_decided(seq).await;
            let (_, value) = self.paxos.status(seq).await;
            if Self::holds_op(&value, client, op_id) {
                return Some(seq);
            }
            // somebody else's proposal won this slot; try the next one
        }
    }

    /// Applies every decision from `seq_done + 1` through `up_to` in order,
    /// first jump-starting undecided slots with no-ops so the cluster
    /// eventually fills the holes.
    async fn apply_through(&mut self, up_to: Seq) {
        if up_to <= self.seq_done {
            return;
        }

        for seq in (self.seq_done + 1)..=up_to {
            let (decided, _) = self.paxos.status(seq).await;
            if !decided {
                self.paxos.start(seq, LogEntry::Noop).await;
            }
        }

        for seq in (self.seq_done + 1)..=up_to {
            let (decided, mut value) = self.paxos.status(seq).await;
            if !decided {
                self.wait_decided(seq).await;
                (_, value) = self.paxos.status(seq).await;
            }
            if let Some(LogEntry::Op(op)) = value {
                let (client, op_id) = M::ids(&op);
                let output = self.machine.apply(&op);
                pf_trace!(self.me; "applied op {:#x} at seq {}", op_id, seq);
                self.op_log
                    .entry(client)
                    .or_default()
                    .insert(seq, OpRecord { op_id, output });
                self.trim(client);
            }
            self.seq_done = seq;
        }

        self.paxos.done(self.seq_done).await;
    }

    /// Polls until the local peer has observed the decision for `seq`,
    /// backing off exponentially from 10 ms up to 10 s.
    async fn wait_decided(&self, seq: Seq) {
        let mut backoff = BACKOFF_INIT;
        loop {
            let (decided, _) = self.paxos.status(seq).await;
            if decided {
                return;
            }
            time::sleep(backoff).await;
            if backoff < BACKOFF_MAX {
                backoff *= 2;
            }
        }
    }

    fn holds_op(
        value: &Option<LogEntry<M::Op>>,
        client: u64,
        op_id: u64,
    ) -> bool {
        matches!(value, Some(LogEntry::Op(op)) if M::ids(op) == (client, op_id))
    }

    fn lookup(&self, client: u64, op_id: u64) -> Option<M::Output> {
        self.op_log
            .get(&client)?
            .values()
            .find(|record| record.op_id == op_id)
            .map(|record| record.output.clone())
    }

    /// Prunes a client's records down to the most recent few; replays older
    /// than the window are no longer answerable from the log.
    fn trim(&mut self, client: u64) {
        if let Some(records) = self.op_log.get_mut(&client) {
            while records.len() > OPLOG_WINDOW {
                let Some(oldest) = records.keys().copied().min() else {
                    break;
                };
                records.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod driver_tests {
    use super::*;
    use crate::paxos::PaxosConfig;
    use crate::utils::SynodError;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CountOp {
        client: u64,
        op_id: u64,
        amount: u64,
    }

    struct CounterMachine {
        total: u64,
    }

    impl StateMachine for CounterMachine {
        type Op = CountOp;
        type Output = u64;

        fn ids(op: &CountOp) -> (u64, u64) {
            (op.client, op.op_id)
        }

        fn apply(&mut self, op: &CountOp) -> u64 {
            self.total += op.amount;
            self.total
        }
    }

    async fn solo_driver(
        port: u16,
    ) -> Result<LogDriver<CounterMachine>, SynodError> {
        let peers = vec![format!("127.0.0.1:{}", port).parse()?];
        let config = PaxosConfig {
            gc_interval_ms: 100,
            call_timeout_ms: 100,
            storage_dir: String::new(),
        };
        let paxos = Arc::new(PaxosPeer::new_and_setup(peers, 0, config).await?);
        Ok(LogDriver::new(0, CounterMachine { total: 0 }, paxos))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_applies_in_order() -> Result<(), SynodError> {
        let mut driver = solo_driver(54200).await?;
        for i in 1..=5u64 {
            let total = driver
                .submit(CountOp {
                    client: 1,
                    op_id: i,
                    amount: i,
                })
                .await;
            assert_eq!(total, (1..=i).sum::<u64>());
        }
        assert_eq!(driver.machine.total, 15);
        driver.paxos.kill();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_returns_recorded_output() -> Result<(), SynodError> {
        let mut driver = solo_driver(54201).await?;
        let op = CountOp {
            client: 9,
            op_id: 0x1234,
            amount: 7,
        };
        let first = driver.submit(op.clone()).await;
        assert_eq!(first, 7);

        // an unrelated operation lands in between the retry
        driver
            .submit(CountOp {
                client: 9,
                op_id: 0x5678,
                amount: 3,
            })
            .await;

        // the retried op replays its original output, not a re-execution
        let replay = driver.submit(op).await;
        assert_eq!(replay, 7);
        assert_eq!(driver.machine.total, 10);
        driver.paxos.kill();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dedupe_log_stays_bounded() -> Result<(), SynodError> {
        let mut driver = solo_driver(54202).await?;
        for i in 0..20u64 {
            driver
                .submit(CountOp {
                    client: 2,
                    op_id: 1000 + i,
                    amount: 1,
                })
                .await;
        }
        assert!(driver.op_log[&2].len() <= OPLOG_WINDOW);
        assert_eq!(driver.machine.total, 20);
        driver.paxos.kill();
        Ok(())
    }
}
