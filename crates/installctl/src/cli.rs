//! CLI - Command-line argument parsing

use clap::{Args, Parser, Subcommand};

/// Citadel installer control
#[derive(Parser, Debug)]
#[command(name = "installctl")]
#[command(about = "Drive and observe the Citadel install back-end", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Path to daemon socket (overrides $INSTALLER_SOCKET and the default)
    #[arg(long, global = true)]
    pub socket: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the install session
    Status {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// List candidate target disks
    Disks {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Start an install session
    Start(StartArgs),

    /// Run the stages of a session started with --no-begin
    Begin,

    /// Re-run the stage the install is paused on
    Retry,

    /// Skip the stage the install is paused on
    Skip,

    /// Abort the install
    Abort,

    /// Clear a finished session
    Reset,

    /// Print events as they happen, reconnecting when the connection drops
    Watch {
        /// Exit once the install finishes
        #[arg(long)]
        exit_on_finish: bool,
    },

    /// Ping daemon (hidden - for health checks only)
    #[command(hide = true)]
    Ping,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Target disk, e.g. /dev/sda
    #[arg(long)]
    pub disk: String,

    /// Name of the account to create
    #[arg(long)]
    pub username: String,

    #[arg(long, default_value = "en_US.UTF-8")]
    pub locale: String,

    #[arg(long, default_value = "UTC")]
    pub timezone: String,

    #[arg(long, default_value = "citadel")]
    pub hostname: String,

    /// Leave out a skippable stage (repeatable)
    #[arg(long = "skip", value_name = "STAGE")]
    pub skip: Vec<String>,

    /// Create the session without running any stage yet
    #[arg(long)]
    pub no_begin: bool,

    /// Follow events until the install finishes
    #[arg(long)]
    pub watch: bool,
}
