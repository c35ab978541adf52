//! Splitfs storage node executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use splitfs::{
    config_text, logger_init, pf_error, set_me, SplitfsError, StorageNode,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the command listener.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Port serving commands from the master and from peer nodes.
    /// This port must be available at process launch.
    #[arg(short, long)]
    port: u16,

    /// Port of the master to register with.
    #[arg(short, long, default_value_t = 9000)]
    master_port: u16,

    /// Node configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Node configuration TOML file, used if `--config` is empty.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(SplitfsError)` on any error.
    fn sanitize(&self) -> Result<(), SplitfsError> {
        if self.port <= 1024 {
            Err(SplitfsError::msg(format!("invalid port {}", self.port)))
        } else if self.master_port <= 1024 {
            Err(SplitfsError::msg(format!(
                "invalid master_port {}",
                self.master_port
            )))
        } else if self.port == self.master_port {
            Err(SplitfsError::msg(format!(
                "port == master_port {}",
                self.port
            )))
        } else if self.threads < 2 {
            Err(SplitfsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of a Splitfs storage node.
fn node_main() -> Result<(), SplitfsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    set_me(format!("n:{}", args.port));

    let bind_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.port)
        .parse()
        .map_err(|e| {
            SplitfsError::msg(format!(
                "failed to parse bind_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.port, e
            ))
        })?;
    let config_str = config_text(&args.config, args.config_file.as_deref())?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-node")
            .build()?;

        // enter tokio runtime, setup the storage node, and start the main
        // event loop logic
        runtime.block_on(async move {
            let mut node = StorageNode::new_and_setup(
                bind_addr,
                args.master_port,
                config_str.as_deref(),
            )
            .await?;

            node.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), SplitfsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Splitfs storage node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = node_main() {
        pf_error!("node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args(port: u16, master_port: u16, threads: usize) -> CliArgs {
        CliArgs {
            bind_ip: Ipv4Addr::LOCALHOST,
            port,
            master_port,
            config: String::new(),
            config_file: None,
            threads,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert_eq!(args(7001, 9000, 2).sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_invalid_port() {
        assert!(args(80, 9000, 2).sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_master_port() {
        assert!(args(7001, 1000, 2).sanitize().is_err());
    }

    #[test]
    fn sanitize_same_ports() {
        assert!(args(9000, 9000, 2).sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        assert!(args(7001, 9000, 1).sanitize().is_err());
    }
}
