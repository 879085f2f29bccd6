//! View service daemon executable.

use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use synod::{parsed_config, pf_error, pf_info, SynodError, ViewConfig, ViewServer};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Address to listen on for Ping/Get requests.
    addr: SocketAddr,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// TOML string of configuration field overrides.
    #[arg(short, long)]
    config: Option<String>,
}

// View service daemon main entrance.
fn server_main() -> Result<(), SynodError> {
    let args = CliArgs::parse();
    let config = parsed_config!(args.config.as_deref() => ViewConfig;
                                ping_interval_ms, dead_pings)?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads.max(2))
        .thread_name("tokio-worker-view")
        .build()?;

    runtime.block_on(async move {
        let server = ViewServer::new_and_setup(args.addr, config).await?;
        pf_info!("view"; "view service listening on {}", args.addr);

        wait_term_signal().await?;
        pf_info!("view"; "termination signal received, shutting down");
        server.kill();
        Ok::<(), SynodError>(())
    })
}

/// Blocks until SIGINT or SIGTERM arrives.
async fn wait_term_signal() -> Result<(), SynodError> {
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("view"; "server_main exitted: {}", e);
        std::process::exit(1);
    }
}
