//! Splitfs interactive client executable.

use std::process::ExitCode;

use clap::Parser;

use tokio::runtime::Builder;

use splitfs::{logger_init, pf_error, set_me, NodeAddr, SplitfsError};

mod repl;

use crate::repl::ClientRepl;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Master's 'host:port' to connect to at startup; can also be set later
    /// with the 'connect' command.
    #[arg(short, long)]
    master: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(master)` on success
    /// or `Err(SplitfsError)` on any error.
    fn sanitize(&self) -> Result<Option<NodeAddr>, SplitfsError> {
        if self.threads < 2 {
            Err(SplitfsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            self.master
                .as_deref()
                .map(str::parse::<NodeAddr>)
                .transpose()
        }
    }
}

/// Actual main function of the Splitfs client.
fn client_main() -> Result<(), SplitfsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let master = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime and run the REPL loop
    runtime.block_on(async move {
        let mut repl = ClientRepl::new(master);
        repl.run().await
    })
}

/// Main function of the Splitfs client.
fn main() -> ExitCode {
    logger_init();
    set_me("c");

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
