//! Command-list stage executor.
//!
//! A stage is an ordered list of command templates. Each template is split
//! on whitespace and every token has `$VARS` from the install parameters
//! substituted, so a value containing spaces stays a single argument.
//! Secrets are only ever substituted into a command's stdin `input`.

use async_trait::async_trait;
use installer_common::StageError;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CancelSignal, StageContext, StageExecutor, StageOutcome, StageParams};
use crate::config::{CommandConfig, StageConfig};

/// UUID given to the LUKS header so the boot image can find the volume.
pub const LUKS_UUID: &str = "683a17fc-4457-42cc-a946-cde67195a101";

/// File name of the transient disk passphrase under `passphrase_dir`.
pub const PASSFILE_NAME: &str = "luks-passphrase";

const STDERR_TAIL_LINES: usize = 20;

const PUBLIC_VARS: &[&str] = &[
    "TARGET",
    "PART1",
    "PART2",
    "MOUNT",
    "ARTIFACTS",
    "LOCALE",
    "TIMEZONE",
    "HOSTNAME",
    "USERNAME",
    "LUKS_PASSFILE",
    "LUKS_UUID",
];

const SECRET_VARS: &[&str] = &["LUKS_PASSPHRASE", "ACCOUNT_PASSPHRASE"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("stage '{stage}' has no commands")]
    NoCommands { stage: String },

    #[error("stage '{stage}' has an empty command")]
    EmptyCommand { stage: String },

    #[error("stage '{stage}': unknown variable ${var} in `{command}`")]
    UnknownVariable {
        stage: String,
        command: String,
        var: String,
    },

    #[error("stage '{stage}': secret ${var} may only be used in `input`, not in `{command}`")]
    SecretOnCommandLine {
        stage: String,
        command: String,
        var: String,
    },
}

static VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Z0-9_]+)").expect("variable pattern"));

/// Names of `$VARS` referenced by a template.
fn referenced_vars(template: &str) -> Vec<&str> {
    VAR.captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .map(|name| name.as_str())
        .collect()
}

/// Replace every `$VAR` in `template` using `lookup`. Unknown names are
/// left as they are; templates are checked when the stage is built.
fn expand(template: &str, lookup: &HashMap<&'static str, String>) -> String {
    VAR.replace_all(template, |caps: &Captures| match lookup.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Partition device path: `/dev/sda` -> `/dev/sda1`, `/dev/nvme0n1` -> `/dev/nvme0n1p1`.
pub fn partition_path(target: &str, number: u32) -> String {
    if target.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", target, number)
    } else {
        format!("{}{}", target, number)
    }
}

pub fn passfile_path(params: &StageParams) -> PathBuf {
    Path::new(&params.install.passphrase_dir).join(PASSFILE_NAME)
}

/// Public variables, safe to log and to put on a command line.
fn public_vars(params: &StageParams) -> HashMap<&'static str, String> {
    let config = &params.config;
    let install = &params.install;
    HashMap::from([
        ("TARGET", config.target_disk.clone()),
        ("PART1", partition_path(&config.target_disk, 1)),
        ("PART2", partition_path(&config.target_disk, 2)),
        ("MOUNT", install.mount_point.clone()),
        ("ARTIFACTS", install.artifact_dir.clone()),
        ("LOCALE", config.locale.clone()),
        ("TIMEZONE", config.timezone.clone()),
        ("HOSTNAME", config.hostname.clone()),
        ("USERNAME", config.username.clone()),
        ("LUKS_PASSFILE", passfile_path(params).to_string_lossy().to_string()),
        ("LUKS_UUID", LUKS_UUID.to_string()),
    ])
}

fn secret_vars(params: &StageParams) -> HashMap<&'static str, String> {
    let mut vars = public_vars(params);
    vars.insert(
        "LUKS_PASSPHRASE",
        params.config.disk_passphrase.expose().to_string(),
    );
    vars.insert(
        "ACCOUNT_PASSPHRASE",
        params.config.account_passphrase.expose().to_string(),
    );
    vars
}

#[derive(Debug, Clone)]
struct CommandTemplate {
    line: String,
    input: Option<String>,
    may_fail: bool,
}

impl CommandTemplate {
    fn argv(&self, vars: &HashMap<&'static str, String>) -> Vec<String> {
        self.line
            .split_whitespace()
            .map(|token| expand(token, vars))
            .collect()
    }
}

/// Executes a configured command list.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    commands: Vec<CommandTemplate>,
    needs_passfile: bool,
}

impl CommandStage {
    pub fn from_config(stage: &StageConfig) -> Result<Self, TemplateError> {
        if stage.commands.is_empty() {
            return Err(TemplateError::NoCommands {
                stage: stage.name.clone(),
            });
        }

        let mut commands = Vec::with_capacity(stage.commands.len());
        let mut needs_passfile = false;
        for command in &stage.commands {
            check_command(&stage.name, command)?;
            needs_passfile |= referenced_vars(command.run()).contains(&"LUKS_PASSFILE")
                || command
                    .input()
                    .is_some_and(|i| referenced_vars(i).contains(&"LUKS_PASSFILE"));
            commands.push(CommandTemplate {
                line: command.run().to_string(),
                input: command.input().map(str::to_string),
                may_fail: command.may_fail(),
            });
        }

        Ok(Self {
            name: stage.name.clone(),
            commands,
            needs_passfile,
        })
    }
}

fn check_command(stage: &str, command: &CommandConfig) -> Result<(), TemplateError> {
    let run = command.run();
    if run.trim().is_empty() {
        return Err(TemplateError::EmptyCommand {
            stage: stage.to_string(),
        });
    }
    for var in referenced_vars(run) {
        if SECRET_VARS.contains(&var) {
            return Err(TemplateError::SecretOnCommandLine {
                stage: stage.to_string(),
                command: run.to_string(),
                var: var.to_string(),
            });
        }
        if !PUBLIC_VARS.contains(&var) {
            return Err(TemplateError::UnknownVariable {
                stage: stage.to_string(),
                command: run.to_string(),
                var: var.to_string(),
            });
        }
    }
    if let Some(input) = command.input() {
        for var in referenced_vars(input) {
            if !PUBLIC_VARS.contains(&var) && !SECRET_VARS.contains(&var) {
                return Err(TemplateError::UnknownVariable {
                    stage: stage.to_string(),
                    command: run.to_string(),
                    var: var.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StageExecutor for CommandStage {
    async fn execute(&self, ctx: StageContext) -> StageOutcome {
        let public = public_vars(&ctx.params);
        let secret = secret_vars(&ctx.params);
        let mut cancel = ctx.cancel.clone();

        // Removed on every exit path, including task abort.
        let _passfile = if self.needs_passfile {
            match PassphraseFile::create(
                &passfile_path(&ctx.params),
                ctx.params.config.disk_passphrase.expose(),
            ) {
                Ok(file) => Some(file),
                Err(e) => {
                    return StageOutcome::Failed(
                        StageError::new("could not write the disk passphrase file")
                            .with_detail(e.to_string()),
                    )
                }
            }
        } else {
            None
        };

        let total = self.commands.len();
        for (i, template) in self.commands.iter().enumerate() {
            if cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }

            let argv = template.argv(&public);
            let input = template.input.as_ref().map(|i| expand(i, &secret));
            ctx.progress
                .report(Some((i * 100 / total) as u8), Some(template.line.clone()));
            info!(stage = %self.name, attempt = ctx.attempt, "Running: {}", argv.join(" "));

            match run_command(&argv, input, &mut cancel).await {
                CommandResult::Success => {}
                CommandResult::Cancelled => {
                    info!(stage = %self.name, "Stage cancelled while running {}", argv[0]);
                    return StageOutcome::Cancelled;
                }
                CommandResult::Failed(error) if template.may_fail => {
                    warn!(stage = %self.name, "Ignoring failure: {}", error.summary);
                }
                CommandResult::Failed(error) => return StageOutcome::Failed(error),
            }
        }

        ctx.progress.report(Some(100), None);
        StageOutcome::Succeeded
    }
}

enum CommandResult {
    Success,
    Failed(StageError),
    Cancelled,
}

async fn run_command(
    argv: &[String],
    input: Option<String>,
    cancel: &mut CancelSignal,
) -> CommandResult {
    let Some((program, args)) = argv.split_first() else {
        return CommandResult::Failed(StageError::new("empty command"));
    };

    let mut child = match Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return CommandResult::Failed(
                StageError::new(format!("could not run `{}`", program)).with_detail(e.to_string()),
            )
        }
    };

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), input) {
        tokio::spawn(async move {
            let _ = stdin.write_all(input.as_bytes()).await;
        });
    }
    let stdout = tokio::spawn(drain(child.stdout.take()));
    let stderr = tokio::spawn(drain(child.stderr.take()));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let Some(status) = waited else {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", program, e);
        }
        return CommandResult::Cancelled;
    };

    let stdout = stdout.await.unwrap_or_default();
    let stderr = stderr.await.unwrap_or_default();
    if !stdout.is_empty() {
        debug!("{} stdout: {}", program, String::from_utf8_lossy(&stdout).trim_end());
    }

    match status {
        Ok(status) if status.success() => CommandResult::Success,
        Ok(status) => {
            let how = match status.code() {
                Some(code) => format!("exited with status {}", code),
                None => "was killed by a signal".to_string(),
            };
            let mut error = StageError::new(format!("command `{}` {}", program, how));
            let tail = tail_lines(&String::from_utf8_lossy(&stderr), STDERR_TAIL_LINES);
            if !tail.is_empty() {
                error = error.with_detail(tail);
            }
            CommandResult::Failed(error)
        }
        Err(e) => CommandResult::Failed(
            StageError::new(format!("lost track of `{}`", program)).with_detail(e.to_string()),
        ),
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Disk passphrase written 0600 for tools that read keys from a file.
/// The file is removed when the guard drops.
struct PassphraseFile {
    path: PathBuf,
}

impl PassphraseFile {
    fn create(path: &Path, passphrase: &str) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(passphrase.as_bytes())?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PassphraseFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}
