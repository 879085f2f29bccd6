//! Proposer side of the Synod protocol; one task per `start()`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;

use tokio::sync::{watch, Mutex};
use tokio::time::{self, Duration};

use crate::paxos::messages::{PeerReply, PeerRequest};
use crate::paxos::peer::{self, PeerState};
use crate::paxos::{PaxosValue, Proposal, Seq};
use crate::utils::rpc;

/// Everything a proposer task needs, detached from the peer handle so that
/// the task owns its context outright.
pub(crate) struct ProposerCtx<V> {
    pub(crate) peers: Vec<SocketAddr>,
    pub(crate) me: usize,
    pub(crate) majority: usize,
    pub(crate) call_timeout: Duration,
    pub(crate) storage_dir: Option<PathBuf>,
    pub(crate) state: Arc<Mutex<PeerState<V>>>,
    pub(crate) rx_term: watch::Receiver<bool>,
}

/// Smallest proposal number strictly above `floor` that keeps this
/// proposer's residue `init` modulo the cluster size.
fn next_proposal(floor: Proposal, init: Proposal, population: i64) -> Proposal {
    init + ((floor - init).div_euclid(population) + 1) * population
}

/// Runs the three protocol phases for instance `seq` until some value is
/// decided or the peer is killed. Rejections and missing replies are
/// handled by bumping the proposal number and retrying the whole attempt.
pub(crate) async fn propose<V: PaxosValue>(
    ctx: ProposerCtx<V>,
    seq: Seq,
    mut value: V,
) {
    let population = ctx.peers.len() as i64;
    let init = (ctx.me as i64 + seq).rem_euclid(population);
    let mut n = init;

    while !*ctx.rx_term.borrow() {
        // stop as soon as this instance is locally known decided
        {
            let guard = ctx.state.lock().await;
            if let Some(inst) = guard.instances.get(&seq) {
                if inst.decided {
                    return;
                }
            }
        }

        // phase 1: solicit promises; adopt the value accepted at the
        // highest proposal number any acceptor reports
        let replies = broadcast(&ctx, PeerRequest::Prepare { seq, n }).await;
        let mut prepare_oks = 0;
        let mut n_seen: Proposal = -1;
        let mut done_seen = Vec::new();
        for (from, reply) in replies {
            let Some(PeerReply::Prepare {
                n_a,
                v_a,
                reject,
                done,
            }) = reply
            else {
                continue;
            };
            done_seen.push((from, done));
            if reject {
                continue;
            }
            prepare_oks += 1;
            if n_a > n_seen {
                n_seen = n_a;
                if let Some(v) = v_a {
                    value = v;
                }
            }
        }
        fold_done(&ctx, &done_seen).await;
        if prepare_oks < ctx.majority {
            n = next_proposal(n.max(n_seen), init, population);
            backoff_jitter().await;
            continue;
        }

        // phase 2: solicit acceptances of the (possibly adopted) value
        let replies = broadcast(
            &ctx,
            PeerRequest::Accept {
                seq,
                n,
                value: value.clone(),
            },
        )
        .await;
        let mut accept_oks = 0;
        let mut done_seen = Vec::new();
        for (from, reply) in replies {
            let Some(PeerReply::Accept { reject, done }) = reply else {
                continue;
            };
            done_seen.push((from, done));
            if !reject {
                accept_oks += 1;
            }
        }
        fold_done(&ctx, &done_seen).await;
        if accept_oks < ctx.majority {
            n = next_proposal(n.max(n_seen), init, population);
            backoff_jitter().await;
            continue;
        }

        // phase 3: announce the decision everywhere, learning each
        // replier's done watermark along the way
        let replies = broadcast(
            &ctx,
            PeerRequest::Decided {
                seq,
                n,
                value: value.clone(),
            },
        )
        .await;
        let mut done_seen = Vec::new();
        for (from, reply) in replies {
            if let Some(PeerReply::Decided { done, .. }) = reply {
                done_seen.push((from, done));
            }
        }
        fold_done(&ctx, &done_seen).await;
        return;
    }
}

/// Sends `req` to every peer concurrently, dispatching to the local
/// acceptor directly for self. Returns per-peer replies, `None` standing
/// for a transport failure or timeout.
async fn broadcast<V: PaxosValue>(
    ctx: &ProposerCtx<V>,
    req: PeerRequest<V>,
) -> Vec<(usize, Option<PeerReply<V>>)> {
    let calls = ctx.peers.iter().enumerate().map(|(from, &addr)| {
        let req = req.clone();
        async move {
            let reply = if from == ctx.me {
                Some(
                    peer::handle_request(
                        &ctx.state,
                        ctx.storage_dir.as_deref(),
                        req,
                    )
                    .await,
                )
            } else {
                rpc::call(addr, &req, ctx.call_timeout).await.ok()
            };
            (from, reply)
        }
    });
    join_all(calls).await
}

/// Folds piggybacked `done` watermarks into the local table; each entry is
/// monotone, so only advances are recorded.
async fn fold_done<V: PaxosValue>(
    ctx: &ProposerCtx<V>,
    done_seen: &[(usize, Seq)],
) {
    if done_seen.is_empty() {
        return;
    }
    let mut guard = ctx.state.lock().await;
    for &(from, done) in done_seen {
        if done > guard.done[from] {
            guard.done[from] = done;
        }
    }
}

/// Short randomized pause between attempts so that dueling proposers for
/// the same instance eventually interleave instead of livelocking.
async fn backoff_jitter() {
    let pause = 5 + rand::random::<u64>() % 10;
    time::sleep(Duration::from_millis(pause)).await;
}

#[cfg(test)]
mod proposer_tests {
    use super::*;

    #[test]
    fn residue_is_preserved() {
        for me in 0..5i64 {
            for seq in 0..7i64 {
                let init = (me + seq).rem_euclid(5);
                let mut n = init;
                for _ in 0..4 {
                    n = next_proposal(n, init, 5);
                    assert_eq!(n.rem_euclid(5), init);
                }
            }
        }
    }

    #[test]
    fn strictly_above_floor() {
        // first bump from the initial number
        assert_eq!(next_proposal(0, 0, 3), 3);
        assert_eq!(next_proposal(2, 2, 3), 5);
        // catching up past a higher number seen from another proposer
        assert_eq!(next_proposal(7, 1, 3), 10);
        assert_eq!(next_proposal(9, 1, 3), 10);
        assert_eq!(next_proposal(10, 1, 3), 13);
        // floor below the residue start
        assert_eq!(next_proposal(-1, 2, 3), 2);
    }
}
