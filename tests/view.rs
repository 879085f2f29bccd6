//! View service integration tests over loopback TCP.

use std::net::SocketAddr;

use synod::{SynodError, View, ViewClient, ViewConfig, ViewServer};

use tokio::time::{self, Duration, Instant};

const TICK_MS: u64 = 25;

fn test_config() -> ViewConfig {
    ViewConfig {
        ping_interval_ms: TICK_MS,
        dead_pings: 3,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bootstrap_then_backup_joins() -> Result<(), SynodError> {
    let addr: SocketAddr = "127.0.0.1:54650".parse()?;
    let server = ViewServer::new_and_setup(addr, test_config()).await?;

    let a = ViewClient::new("a", addr);
    let b = ViewClient::new("b", addr);

    // first pinger becomes primary of view 1, alone
    let view = a.ping(0).await?;
    assert_eq!(view.viewnum, 1);
    assert_eq!(view.primary.as_deref(), Some("a"));
    assert_eq!(view.backup, None);

    // until the primary acknowledges, nothing moves
    let view = b.ping(0).await?;
    assert_eq!(view.viewnum, 1);

    // acknowledged; the idle server gets pulled in as backup
    a.ping(1).await?;
    let view = b.ping(0).await?;
    assert_eq!(view.viewnum, 2);
    assert_eq!(view.primary.as_deref(), Some("a"));
    assert_eq!(view.backup.as_deref(), Some("b"));

    // read-only fetch agrees and does not disturb anything
    let got = a.get().await?;
    assert_eq!(got, view);

    server.kill();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn primary_failure_promotes_backup() -> Result<(), SynodError> {
    let addr: SocketAddr = "127.0.0.1:54651".parse()?;
    let server = ViewServer::new_and_setup(addr, test_config()).await?;

    let a = ViewClient::new("a", addr);
    let b = ViewClient::new("b", addr);

    a.ping(0).await?;
    a.ping(1).await?;
    b.ping(0).await?;
    let view = a.ping(2).await?;
    assert_eq!(view.viewnum, 2);

    // a falls silent; b keeps pinging and must end up primary
    let mut adopted = view.viewnum;
    let deadline = Instant::now() + Duration::from_secs(5);
    let promoted: View = loop {
        let view = b.ping(adopted).await?;
        adopted = view.viewnum;
        if view.primary.as_deref() == Some("b") {
            break view;
        }
        assert!(Instant::now() < deadline, "b never promoted");
        time::sleep(Duration::from_millis(TICK_MS)).await;
    };

    // the successor primary came from the prior view's pair
    assert_eq!(promoted.viewnum, 3);
    assert_eq!(promoted.backup, None);

    server.kill();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_server_backfills_after_backup_death() -> Result<(), SynodError> {
    let addr: SocketAddr = "127.0.0.1:54652".parse()?;
    let server = ViewServer::new_and_setup(addr, test_config()).await?;

    let a = ViewClient::new("a", addr);
    let b = ViewClient::new("b", addr);
    let c = ViewClient::new("c", addr);

    a.ping(0).await?;
    a.ping(1).await?;
    b.ping(0).await?;
    a.ping(2).await?;

    // b dies; a and the idle c keep pinging
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut adopted = 2;
    loop {
        let view = a.ping(adopted).await?;
        adopted = view.viewnum;
        c.ping(0).await?;
        if view.backup.as_deref() == Some("c") {
            assert_eq!(view.primary.as_deref(), Some("a"));
            break;
        }
        assert!(Instant::now() < deadline, "c never backfilled");
        time::sleep(Duration::from_millis(TICK_MS)).await;
    }

    server.kill();
    Ok(())
}
