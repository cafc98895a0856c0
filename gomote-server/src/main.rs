//! `gomoteserver` entry point.

use std::process::ExitCode;

use clap::Parser;
use gomote_core::telemetry;
use gomote_server::bootstrap::{self, Collaborators};
use gomote_server::cli::ServerArgs;
use gomote_server::error::error_chain;
use gomote_server::serve::setup_signal_handlers;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = ServerArgs::parse().into_settings();

    // The guard flushes buffered log lines on drop; hold it until exit.
    let _guard = match telemetry::init(settings.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("gomoteserver: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %settings.listen_addr,
        ssh_addr = %settings.ssh_addr,
        mode = %settings.mode,
        "Starting gomote server"
    );

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let err = bootstrap::run(settings, Collaborators::production(), shutdown).await;
    error!(error = %error_chain(&err), "gomote server exiting");
    ExitCode::FAILURE
}
