//! Subcommand implementations

use anyhow::{bail, Context, Result};
use installer_common::{Command, InstallConfig, Secret};
use owo_colors::OwoColorize;

use crate::cli::{Cli, Commands, StartArgs};
use crate::client::{discover_socket_path, InstallClient};
use crate::render;
use crate::watch::{follow, WatchOptions, WatchUpdate};

pub const ACCOUNT_PASSPHRASE_ENV: &str = "INSTALLER_ACCOUNT_PASSPHRASE";
pub const DISK_PASSPHRASE_ENV: &str = "INSTALLER_DISK_PASSPHRASE";

const CONNECT_ATTEMPTS: u32 = 5;

pub async fn run(cli: Cli) -> Result<()> {
    let path = discover_socket_path(cli.socket.as_deref());

    match cli.command {
        Commands::Status { json } => status(&path, json).await,
        Commands::Disks { json } => disks(&path, json).await,
        Commands::Start(args) => start(&path, args).await,
        Commands::Begin => simple(&path, Command::Begin, "Install running").await,
        Commands::Retry => simple(&path, Command::Retry, "Retrying stage").await,
        Commands::Skip => simple(&path, Command::Skip, "Stage skipped").await,
        Commands::Abort => simple(&path, Command::Abort, "Abort requested").await,
        Commands::Reset => simple(&path, Command::ResetSession, "Session cleared").await,
        Commands::Watch { exit_on_finish } => watch(&path, exit_on_finish).await,
        Commands::Ping => {
            let mut client = InstallClient::connect_with_retry(&path, CONNECT_ATTEMPTS).await?;
            client.ping().await?;
            println!("pong (installd {})", client.welcome().daemon_version);
            Ok(())
        }
    }
}

async fn status(path: &str, json: bool) -> Result<()> {
    let mut client = InstallClient::connect_with_retry(path, CONNECT_ATTEMPTS).await?;
    let snapshot = client.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render::snapshot(&snapshot));
    }
    Ok(())
}

async fn disks(path: &str, json: bool) -> Result<()> {
    let mut client = InstallClient::connect_with_retry(path, CONNECT_ATTEMPTS).await?;
    let disks = client.disks().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&disks)?);
    } else {
        print!("{}", render::disks(&disks));
    }
    Ok(())
}

async fn simple(path: &str, command: Command, done: &str) -> Result<()> {
    let mut client = InstallClient::connect_with_retry(path, CONNECT_ATTEMPTS).await?;
    client.send(command).await?;
    println!("{}", done.bright_green());
    Ok(())
}

async fn start(path: &str, args: StartArgs) -> Result<()> {
    // Connect before prompting so a missing daemon fails fast
    let mut client = InstallClient::connect_with_retry(path, CONNECT_ATTEMPTS).await?;
    if !client.welcome().authorized {
        bail!("installd refused control: {}", client.welcome().reason);
    }

    let account_passphrase = read_passphrase(
        ACCOUNT_PASSPHRASE_ENV,
        &format!("Passphrase for user '{}'", args.username),
    )?;
    let disk_passphrase = read_passphrase(DISK_PASSPHRASE_ENV, "Disk encryption passphrase")?;

    let config = InstallConfig {
        target_disk: args.disk,
        hostname: args.hostname,
        locale: args.locale,
        timezone: args.timezone,
        username: args.username,
        account_passphrase,
        disk_passphrase,
        skip_stages: args.skip,
        auto_begin: !args.no_begin,
    };
    let target = config.target_disk.clone();
    client.send(Command::StartInstall(config)).await?;

    if args.no_begin {
        println!("Session created for {}. Run `installctl begin` to start.", target);
        return Ok(());
    }
    println!("Installing to {}", target.bold());
    drop(client);

    if args.watch {
        watch(path, true).await?;
    }
    Ok(())
}

async fn watch(path: &str, exit_on_finish: bool) -> Result<()> {
    let options = WatchOptions {
        until_finished: exit_on_finish,
        ..WatchOptions::default()
    };
    follow(path, &options, |update| match update {
        WatchUpdate::Synced(snapshot) => {
            println!("{}", "-- synced --".dimmed());
            print!("{}", render::snapshot(&snapshot));
        }
        WatchUpdate::Event(envelope) => println!("{}", render::event(&envelope)),
        WatchUpdate::Lost { error, retry_in } => eprintln!(
            "{} {} (reconnecting in {:.1}s)",
            "[LOST]".yellow(),
            error,
            retry_in.as_secs_f64()
        ),
    })
    .await?;
    Ok(())
}

/// Passphrase from `env_var`, or prompted twice on the terminal.
fn read_passphrase(env_var: &str, prompt: &str) -> Result<Secret> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(Secret::new(value));
        }
    }

    loop {
        let passphrase =
            rpassword::prompt_password(format!("{}: ", prompt)).context("Failed to read passphrase")?;
        if passphrase.is_empty() {
            eprintln!("Passphrase cannot be empty");
            continue;
        }
        let confirm = rpassword::prompt_password("Confirm: ").context("Failed to read passphrase")?;
        if passphrase == confirm {
            return Ok(Secret::new(passphrase));
        }
        eprintln!("Passphrases do not match");
    }
}
