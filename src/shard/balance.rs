//! Deterministic shard rebalancing across replica groups.

use std::collections::BTreeMap;

use crate::shard::{Gid, ShardConfig, NSHARDS};

/// Re-spreads shards so that every group holds either `⌊S/G⌋` or `⌈S/G⌉`
/// of them, with exactly `S mod G` groups holding the larger count. Groups
/// are visited in ascending gid order, so every replica applying the same
/// configuration computes the identical placement. Shards already placed on
/// a surviving, not-overfull group stay put.
pub(crate) fn rebalance(config: &mut ShardConfig) {
    let ngroups = config.groups.len();
    if ngroups == 0 {
        config.shards = [0; NSHARDS];
        return;
    }
    let floor = NSHARDS / ngroups;
    let ceil = floor + 1;
    let mut ceil_quota = NSHARDS % ngroups;

    // first pass: keep assignments that still fit under the target counts,
    // collecting everything else as unassigned
    let mut counts: BTreeMap<Gid, usize> =
        config.groups.keys().map(|&gid| (gid, 0)).collect();
    let mut unassigned = Vec::new();
    for shard in 0..NSHARDS {
        let gid = config.shards[shard];
        match counts.get_mut(&gid) {
            Some(count)
                if *count + 1 <= floor
                    || (*count + 1 == ceil && ceil_quota > 0) =>
            {
                *count += 1;
                if *count == ceil {
                    ceil_quota -= 1;
                }
            }
            _ => unassigned.push(shard),
        }
    }

    // second pass: hand the unassigned shards to underfull groups, larger
    // targets going to the lowest gids while the quota lasts
    let mut next = 0;
    for (&gid, count) in counts.iter_mut() {
        if *count == ceil {
            continue; // already at the larger target
        }
        let target = if ceil_quota > 0 {
            ceil_quota -= 1;
            ceil
        } else {
            floor
        };
        while *count < target && next < unassigned.len() {
            config.shards[unassigned[next]] = gid;
            next += 1;
            *count += 1;
        }
    }

    // the quota arithmetic consumes the whole list; should any shard be
    // left over, park it on the first group rather than lose it
    if next < unassigned.len() {
        if let Some((&gid, _)) = config.groups.iter().next() {
            while next < unassigned.len() {
                config.shards[unassigned[next]] = gid;
                next += 1;
            }
        }
    }
}
