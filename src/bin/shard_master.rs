//! Shard master daemon executable.

use std::collections::HashSet;
use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use synod::{parsed_config, pf_error, pf_info, PaxosConfig, ShardMaster, SynodError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Peer-to-peer addresses of all replicas, in replica index order.
    replicas: Vec<SocketAddr>,

    /// Replica index of myself.
    #[arg(short, long)]
    id: usize,

    /// Address to listen on for client requests.
    #[arg(short, long)]
    api_addr: SocketAddr,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// TOML string of configuration field overrides.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), SynodError> {
        let mut replicas_set = HashSet::new();
        for addr in self.replicas.iter() {
            if !replicas_set.insert(addr) {
                return Err(SynodError(format!(
                    "duplicate replica address '{}' given",
                    addr
                )));
            }
        }

        if self.id >= self.replicas.len() {
            return Err(SynodError(format!(
                "invalid replica index {} / {}",
                self.id,
                self.replicas.len()
            )));
        }

        if self.api_addr == self.replicas[self.id] {
            return Err(SynodError(format!(
                "api_addr clashes with peer address '{}'",
                self.api_addr
            )));
        }

        Ok(())
    }
}

// Shard master daemon main entrance.
fn server_main() -> Result<(), SynodError> {
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = parsed_config!(args.config.as_deref() => PaxosConfig;
                                gc_interval_ms, call_timeout_ms, storage_dir)?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads.max(2))
        .thread_name(format!("tokio-worker-shard{}", args.id))
        .build()?;

    runtime.block_on(async move {
        let server = ShardMaster::new_and_setup(
            args.api_addr,
            args.replicas.clone(),
            args.id,
            config,
        )
        .await?;
        pf_info!(args.id; "shard master listening on {}", args.api_addr);

        wait_term_signal().await?;
        pf_info!(args.id; "termination signal received, shutting down");
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
        pf_error!("shard"; "server_main exitted: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod shard_args_tests {
    use super::*;

    fn base_args() -> Result<CliArgs, SynodError> {
        Ok(CliArgs {
            replicas: vec![
                "127.0.0.1:52810".parse()?,
                "127.0.0.1:52811".parse()?,
                "127.0.0.1:52812".parse()?,
            ],
            id: 0,
            api_addr: "127.0.0.1:52710".parse()?,
            threads: 2,
            config: None,
        })
    }

    #[test]
    fn sanitize_valid() -> Result<(), SynodError> {
        base_args()?.sanitize()
    }

    #[test]
    fn sanitize_duplicate_replica() -> Result<(), SynodError> {
        let mut args = base_args()?;
        args.replicas[1] = args.replicas[2];
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() -> Result<(), SynodError> {
        let mut args = base_args()?;
        args.id = 7;
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
