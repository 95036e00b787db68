// ABOUTME: CLI entry point for running a standalone encode server
// ABOUTME: Binds the encode-frame and hello ports and serves until interrupted

use argh::FromArgs;
use dcp_encode_engine::codec::DeterministicCodec;
use dcp_encode_engine::server::EncodeServer;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(FromArgs)]
/// Run a DCP encode server, accepting remote encode requests on the network.
struct Args {
    /// number of worker threads to run
    #[argh(option, short = 't', default = "1")]
    threads: usize,

    /// enable verbose (debug) logging
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// write logs to this file instead of stderr
    #[argh(option)]
    log: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let subscriber = tracing_subscriber::fmt().with_max_level(level);
    match &args.log {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("failed to open log file {}: {e}", path.display());
                    return ExitCode::FAILURE;
                }
            };
            subscriber.with_writer(file).with_ansi(false).init();
        }
        None => subscriber.init(),
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let server = EncodeServer::new(args.threads, Arc::new(DeterministicCodec));
        info!(threads = args.threads, "starting encode server");
        match server.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "encode server failed to bind");
                ExitCode::FAILURE
            }
        }
    })
}
