//! Configuration management for installd.
//!
//! Loads settings from /etc/installer/config.toml, falls back to the
//! distribution default in /usr/share/installer, or uses built-in defaults.
//! The default `[[stages]]` list is the stock Citadel install pipeline.

use anyhow::{Context, Result};
use installer_common::DEFAULT_SOCKET_PATH;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/installer/config.toml";

/// Distribution default config path
pub const DEFAULT_CONFIG_PATH: &str = "/usr/share/installer/config.toml";

/// Daemon process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Control socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Log filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Outbound frames buffered per connection before it is evicted
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a cancelled stage may take to stop before it is killed
    #[serde(default = "default_abort_grace")]
    pub abort_grace_secs: u64,

    /// Kernel command line flags that mark a live or install boot
    #[serde(default = "default_live_mode_markers")]
    pub live_mode_markers: Vec<String>,

    #[serde(default = "default_cmdline_path")]
    pub cmdline_path: String,
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_abort_grace() -> u64 {
    15
}

fn default_live_mode_markers() -> Vec<String> {
    vec!["citadel.live".to_string(), "citadel.install".to_string()]
}

fn default_cmdline_path() -> String {
    "/proc/cmdline".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_level: default_log_level(),
            queue_capacity: default_queue_capacity(),
            abort_grace_secs: default_abort_grace(),
            live_mode_markers: default_live_mode_markers(),
            cmdline_path: default_cmdline_path(),
        }
    }
}

impl DaemonConfig {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }
}

/// Who may drive the installer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Seat whose active session owner is trusted
    #[serde(default = "default_seat")]
    pub seat: String,

    /// logind seat state directory
    #[serde(default = "default_seat_state_dir")]
    pub seat_state_dir: String,

    /// Uids trusted regardless of seat ownership
    #[serde(default = "default_allowed_uids")]
    pub allowed_uids: Vec<u32>,

    /// Let unauthorized connections run read-only queries and watch events
    #[serde(default)]
    pub allow_unauthorized_reads: bool,
}

fn default_seat() -> String {
    "seat0".to_string()
}

fn default_seat_state_dir() -> String {
    "/run/systemd/seats".to_string()
}

fn default_allowed_uids() -> Vec<u32> {
    vec![0]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            seat: default_seat(),
            seat_state_dir: default_seat_state_dir(),
            allowed_uids: default_allowed_uids(),
            allow_unauthorized_reads: false,
        }
    }
}

/// Stage result history for post-mortem diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_history_path")]
    pub path: String,
}

fn default_true() -> bool {
    true
}

fn default_history_path() -> String {
    "/var/log/installer/history.jsonl".to_string()
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_history_path(),
        }
    }
}

/// Paths and limits used while installing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSection {
    /// Directory for the transient disk passphrase file
    #[serde(default = "default_passphrase_dir")]
    pub passphrase_dir: String,

    /// Scratch mount point for the target filesystems
    #[serde(default = "default_mount_point")]
    pub mount_point: String,

    /// Directory holding rootfs, kernel and bootloader images
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    #[serde(default = "default_min_passphrase_len")]
    pub min_passphrase_len: usize,

    #[serde(default = "default_sys_block_dir")]
    pub sys_block_dir: String,

    #[serde(default = "default_dev_dir")]
    pub dev_dir: String,

    #[serde(default = "default_mounts_path")]
    pub mounts_path: String,
}

fn default_passphrase_dir() -> String {
    "/run/installer".to_string()
}

fn default_mount_point() -> String {
    "/run/installer/mnt".to_string()
}

fn default_artifact_dir() -> String {
    "/run/citadel/images".to_string()
}

fn default_min_passphrase_len() -> usize {
    4
}

fn default_sys_block_dir() -> String {
    "/sys/block".to_string()
}

fn default_dev_dir() -> String {
    "/dev".to_string()
}

fn default_mounts_path() -> String {
    "/proc/self/mounts".to_string()
}

impl Default for InstallSection {
    fn default() -> Self {
        Self {
            passphrase_dir: default_passphrase_dir(),
            mount_point: default_mount_point(),
            artifact_dir: default_artifact_dir(),
            min_passphrase_len: default_min_passphrase_len(),
            sys_block_dir: default_sys_block_dir(),
            dev_dir: default_dev_dir(),
            mounts_path: default_mounts_path(),
        }
    }
}

/// One command of a stage: either a plain command line or a table with
/// stdin input and failure tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Line(String),
    Detailed {
        run: String,
        #[serde(default)]
        input: Option<String>,
        #[serde(default)]
        may_fail: bool,
    },
}

impl CommandConfig {
    pub fn run(&self) -> &str {
        match self {
            CommandConfig::Line(line) => line,
            CommandConfig::Detailed { run, .. } => run,
        }
    }

    pub fn input(&self) -> Option<&str> {
        match self {
            CommandConfig::Line(_) => None,
            CommandConfig::Detailed { input, .. } => input.as_deref(),
        }
    }

    pub fn may_fail(&self) -> bool {
        match self {
            CommandConfig::Line(_) => false,
            CommandConfig::Detailed { may_fail, .. } => *may_fail,
        }
    }
}

/// A pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// Failures pause for a retry decision instead of failing the install
    #[serde(default = "default_true")]
    pub retryable: bool,

    /// The user may opt out of this stage
    #[serde(default)]
    pub skippable: bool,

    pub commands: Vec<CommandConfig>,
}

fn line(s: &str) -> CommandConfig {
    CommandConfig::Line(s.to_string())
}

fn tolerant(s: &str) -> CommandConfig {
    CommandConfig::Detailed {
        run: s.to_string(),
        input: None,
        may_fail: true,
    }
}

fn stage(name: &str, skippable: bool, commands: Vec<CommandConfig>) -> StageConfig {
    StageConfig {
        name: name.to_string(),
        retryable: true,
        skippable,
        commands,
    }
}

/// The stock Citadel pipeline. Every stage starts by undoing what a previous
/// partial attempt may have left behind so that retries start clean.
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        stage(
            "partition",
            false,
            vec![
                tolerant("/sbin/cryptsetup close luks-install"),
                line("/sbin/blkdeactivate $TARGET"),
                line("/sbin/parted -s $TARGET mklabel gpt"),
                line("/sbin/parted -s $TARGET mkpart boot fat32 1MiB 513MiB"),
                line("/sbin/parted -s $TARGET set 1 boot on"),
                line("/sbin/parted -s $TARGET mkpart data ext4 513MiB 100%"),
                line("/sbin/parted -s $TARGET set 2 lvm on"),
            ],
        ),
        stage(
            "encrypt",
            false,
            vec![
                tolerant("/sbin/cryptsetup close luks-install"),
                line("/sbin/cryptsetup -q --uuid=$LUKS_UUID luksFormat $PART2 $LUKS_PASSFILE"),
                line("/sbin/cryptsetup open --type luks --key-file $LUKS_PASSFILE $PART2 luks-install"),
            ],
        ),
        stage(
            "volumes",
            false,
            vec![
                tolerant("/sbin/vgremove -f citadel"),
                line("/sbin/pvcreate -ff --yes /dev/mapper/luks-install"),
                line("/sbin/vgcreate --yes citadel /dev/mapper/luks-install"),
                line("/sbin/lvcreate --yes --size 2g --name rootfsA citadel"),
                line("/sbin/lvcreate --yes --size 2g --name rootfsB citadel"),
                line("/sbin/lvcreate --yes --extents 100%VG --name storage citadel"),
            ],
        ),
        stage(
            "format",
            false,
            vec![
                line("/sbin/mkfs.vfat -F 32 $PART1"),
                line("/bin/mkfs.btrfs -f /dev/mapper/citadel-storage"),
            ],
        ),
        stage(
            "install-packages",
            false,
            vec![
                line("/usr/bin/citadel-image install-rootfs --skip-sha $ARTIFACTS/citadel-rootfs.img"),
                line("/usr/bin/citadel-image install-rootfs --skip-sha --no-prefer $ARTIFACTS/citadel-rootfs.img"),
            ],
        ),
        stage(
            "bootloader",
            false,
            vec![
                tolerant("/bin/umount $MOUNT"),
                line("/bin/mkdir -p $MOUNT"),
                line("/bin/mount $PART1 $MOUNT"),
                line("/usr/bin/bootctl --esp-path=$MOUNT --no-variables install"),
                line("/bin/umount $MOUNT"),
            ],
        ),
        stage(
            "accounts",
            false,
            vec![
                tolerant("/bin/umount $MOUNT"),
                line("/bin/mount /dev/mapper/citadel-storage $MOUNT"),
                CommandConfig::Detailed {
                    run: "/usr/sbin/chpasswd --root $MOUNT".to_string(),
                    input: Some("$USERNAME:$ACCOUNT_PASSPHRASE\n".to_string()),
                    may_fail: false,
                },
                line("/bin/umount $MOUNT"),
            ],
        ),
        stage(
            "configure",
            true,
            vec![
                tolerant("/bin/umount $MOUNT"),
                line("/bin/mount /dev/mapper/citadel-storage $MOUNT"),
                line("/usr/bin/systemd-firstboot --root=$MOUNT --force --locale=$LOCALE --timezone=$TIMEZONE --hostname=$HOSTNAME"),
                line("/bin/umount $MOUNT"),
            ],
        ),
        stage(
            "finish",
            false,
            vec![
                line("/bin/lsblk -o NAME,SIZE,TYPE,FSTYPE $TARGET"),
                line("/sbin/vgchange -an citadel"),
                line("/sbin/cryptsetup luksClose luks-install"),
            ],
        ),
    ]
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub install: InstallSection,

    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            auth: AuthConfig::default(),
            history: HistoryConfig::default(),
            install: InstallSection::default(),
            stages: default_stages(),
        }
    }
}

impl Config {
    /// Load config from file, or return defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn seat_state_file(&self) -> std::path::PathBuf {
        Path::new(&self.auth.seat_state_dir).join(&self.auth.seat)
    }
}
