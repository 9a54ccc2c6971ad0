//! installctl - command-line front-end for installd
//!
//! Every invocation is a fresh connection; the daemon holds all install
//! state, so the CLI can be killed and rerun at any point.

use clap::Parser;
use installctl::cli::Cli;
use installctl::client::ClientError;
use owo_colors::OwoColorize;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match installctl::commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "[ERROR]".red(), e);
            if let Some(hint) = e.downcast_ref::<ClientError>().and_then(ClientError::hint) {
                eprintln!("{}", hint.dimmed());
            }
            ExitCode::FAILURE
        }
    }
}
