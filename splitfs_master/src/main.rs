//! Splitfs master executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use splitfs::{
    config_text, logger_init, pf_error, set_me, MasterNode, SplitfsError,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Port serving clients over TCP and node registrations over UDP.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Master configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Master configuration TOML file, used if `--config` is empty.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(SplitfsError)` on any error.
    fn sanitize(&self) -> Result<(), SplitfsError> {
        if self.port <= 1024 {
            Err(SplitfsError::msg(format!("invalid port {}", self.port)))
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

/// Actual main function of the Splitfs master.
fn master_main() -> Result<(), SplitfsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

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
            .thread_name("tokio-worker-master")
            .build()?;

        // enter tokio runtime, setup the master, and start the main event
        // loop logic
        runtime.block_on(async move {
            let mut master =
                MasterNode::new_and_setup(bind_addr, config_str.as_deref())
                    .await?;

            master.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), SplitfsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the Splitfs master.
fn main() -> ExitCode {
    logger_init();
    set_me("m");

    if let Err(ref e) = master_main() {
        pf_error!("master_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
