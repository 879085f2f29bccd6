//! Primary/backup KV server daemon executable.

use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use synod::{parsed_config, pf_error, pf_info, PbConfig, PbServer, SynodError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Address to listen on for client and forward requests; doubles as
    /// this server's identity at the view service.
    addr: SocketAddr,

    /// Address of the view service.
    #[arg(short, long)]
    view: SocketAddr,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// TOML string of configuration field overrides.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    fn sanitize(&self) -> Result<(), SynodError> {
        if self.addr == self.view {
            return Err(SynodError(format!(
                "addr and view service address both '{}'",
                self.addr
            )));
        }
        Ok(())
    }
}

// Primary/backup server daemon main entrance.
fn server_main() -> Result<(), SynodError> {
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = parsed_config!(args.config.as_deref() => PbConfig;
                                ping_interval_ms, call_timeout_ms)?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads.max(2))
        .thread_name("tokio-worker-pb")
        .build()?;

    runtime.block_on(async move {
        let server =
            PbServer::new_and_setup(args.addr, args.view, config).await?;
        pf_info!(server.identity(); "primary/backup server listening on {}",
                                    args.addr);

        wait_term_signal().await?;
        pf_info!(server.identity(); "termination signal received, \
                                     shutting down");
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
        pf_error!("pb"; "server_main exitted: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod pb_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), SynodError> {
        let args = CliArgs {
            addr: "127.0.0.1:52801".parse()?,
            view: "127.0.0.1:52800".parse()?,
            threads: 2,
            config: None,
        };
        args.sanitize()
    }

    #[test]
    fn sanitize_addr_clash() -> Result<(), SynodError> {
        let args = CliArgs {
            addr: "127.0.0.1:52800".parse()?,
            view: "127.0.0.1:52800".parse()?,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
