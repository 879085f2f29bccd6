//! Shard master integration tests over loopback TCP.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use synod::{
    Gid, PaxosConfig, ShardClient, ShardConfig, ShardMaster, SynodError,
    NSHARDS,
};

fn ports(base: u16, n: usize) -> Vec<SocketAddr> {
    (0..n)
        .map(|i| format!("127.0.0.1:{}", base + i as u16).parse().unwrap())
        .collect()
}

async fn boot_cluster(
    paxos_base: u16,
    api_base: u16,
) -> Result<(Vec<ShardMaster>, Vec<SocketAddr>), SynodError> {
    let peer_addrs = ports(paxos_base, 3);
    let api_addrs = ports(api_base, 3);
    let mut servers = Vec::new();
    for me in 0..3 {
        let config = PaxosConfig {
            gc_interval_ms: 100,
            call_timeout_ms: 100,
            storage_dir: String::new(),
        };
        servers.push(
            ShardMaster::new_and_setup(
                api_addrs[me],
                peer_addrs.clone(),
                me,
                config,
            )
            .await?,
        );
    }
    Ok((servers, api_addrs))
}

fn group_counts(config: &ShardConfig) -> BTreeMap<Gid, usize> {
    let mut counts: BTreeMap<Gid, usize> =
        config.groups.keys().map(|&gid| (gid, 0)).collect();
    for &gid in config.shards.iter() {
        if let Some(count) = counts.get_mut(&gid) {
            *count += 1;
        }
    }
    counts
}

fn assert_balanced(config: &ShardConfig) {
    let ngroups = config.groups.len();
    assert!(ngroups > 0);
    let floor = NSHARDS / ngroups;
    let larger = NSHARDS % ngroups;
    let counts = group_counts(config);
    assert_eq!(counts.values().sum::<usize>(), NSHARDS);
    for &count in counts.values() {
        assert!(count == floor || count == floor + 1);
    }
    assert_eq!(counts.values().filter(|&&c| c == floor + 1).count(), larger);
}

fn group(gid: Gid) -> Vec<String> {
    vec![format!("g{}-a:1000", gid), format!("g{}-b:1000", gid)]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_leave_rebalance_walk() -> Result<(), SynodError> {
    let (servers, api_addrs) = boot_cluster(54500, 54510).await?;
    let client = ShardClient::new(api_addrs.clone());

    // configuration 0 is empty
    let initial = client.query(0).await;
    assert_eq!(initial.num, 0);
    assert!(initial.groups.is_empty());
    assert!(initial.shards.iter().all(|&gid| gid == 0));

    // first group takes every shard
    client.join(100, group(100)).await;
    let config = client.query(-1).await;
    assert!(config.shards.iter().all(|&gid| gid == 100));

    // second group splits 5/5
    client.join(101, group(101)).await;
    let config = client.query(-1).await;
    assert_balanced(&config);
    assert_eq!(group_counts(&config)[&100], 5);
    assert_eq!(group_counts(&config)[&101], 5);

    // third group splits 4/3/3
    client.join(102, group(102)).await;
    let config = client.query(-1).await;
    assert_balanced(&config);

    // first group leaves; back to 5/5 over the survivors
    client.leave(100).await;
    let config = client.query(-1).await;
    assert_balanced(&config);
    assert_eq!(group_counts(&config)[&101], 5);
    assert_eq!(group_counts(&config)[&102], 5);
    assert!(config.shards.iter().all(|&gid| gid != 100));

    // a different replica reads the same configuration sequence
    let mut rotated = api_addrs;
    rotated.rotate_left(1);
    let other = ShardClient::new(rotated);
    let same = other.query(config.num as i64).await;
    assert_eq!(same, config);

    for server in &servers {
        server.kill();
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn move_pins_shard_and_history_stays() -> Result<(), SynodError> {
    let (servers, api_addrs) = boot_cluster(54520, 54530).await?;
    let client = ShardClient::new(api_addrs);

    client.join(7, group(7)).await;
    client.join(8, group(8)).await;
    let before = client.query(-1).await;

    client.move_shard(0, 8).await;
    let after = client.query(-1).await;
    assert_eq!(after.num, before.num + 1);
    assert_eq!(after.shards[0], 8);
    for shard in 1..NSHARDS {
        assert_eq!(after.shards[shard], before.shards[shard]);
    }

    // configurations are immutable history
    let replay = client.query(before.num as i64).await;
    assert_eq!(replay, before);
    let c1 = client.query(1).await;
    assert!(c1.shards.iter().all(|&gid| gid == 7));

    for server in &servers {
        server.kill();
    }
    Ok(())
}
