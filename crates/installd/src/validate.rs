//! Install parameter validation for `StartInstall`.
//!
//! Every problem found is reported; the front-end shows the whole list at
//! once instead of making the user fix one field per round trip.

use installer_common::session::truncate_text;
use installer_common::InstallConfig;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::disk::{DiskProbe, MountTable};

/// Longest passphrase accepted for either secret.
pub const MAX_PASSPHRASE_LEN: usize = 1024;

/// Longest accepted timezone name.
pub const MAX_TIMEZONE_LEN: usize = 64;

/// How much of a rejected value is echoed back in a problem message.
const SHOWN_VALUE_BYTES: usize = 64;

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("username pattern"));

static LOCALE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2,3}_[A-Z]{2}(\.[A-Za-z0-9-]+)?(@[a-z]+)?$").expect("locale pattern")
});

/// Checks install parameters against the machine.
pub trait ConfigValidator: Send + Sync {
    /// Human-readable problems; empty when the config is acceptable.
    fn validate(&self, config: &InstallConfig) -> Vec<String>;
}

impl<F> ConfigValidator for F
where
    F: Fn(&InstallConfig) -> Vec<String> + Send + Sync,
{
    fn validate(&self, config: &InstallConfig) -> Vec<String> {
        self(config)
    }
}

/// Production validator: field syntax plus disk checks against sysfs and
/// the live mount table.
pub struct SystemValidator {
    probe: DiskProbe,
    mounts_path: PathBuf,
    min_passphrase_len: usize,
}

impl SystemValidator {
    pub fn new(probe: DiskProbe, mounts_path: impl Into<PathBuf>, min_passphrase_len: usize) -> Self {
        Self {
            probe,
            mounts_path: mounts_path.into(),
            min_passphrase_len,
        }
    }

    fn check_target(&self, target: &str, problems: &mut Vec<String>) {
        if target.is_empty() {
            problems.push("no target disk selected".to_string());
            return;
        }
        if !Path::new(target).exists() {
            problems.push(format!("target disk {} does not exist", shown(target)));
            return;
        }
        let Some(disk) = self.probe.lookup(target) else {
            problems.push(format!("{} is not a whole-disk block device", shown(target)));
            return;
        };
        if disk.read_only {
            problems.push(format!("target disk {} is read-only", target));
        }

        let table = match MountTable::load(&self.mounts_path) {
            Ok(table) => table,
            Err(e) => {
                problems.push(format!("cannot verify that {} is unused: {:#}", target, e));
                return;
            }
        };
        let mut devices = vec![target.to_string()];
        devices.extend(self.probe.partitions(target));
        for mount in table.mounts_of(&devices) {
            if mount.read_only {
                problems.push(format!(
                    "{} is mounted read-only at {}",
                    mount.device, mount.mount_point
                ));
            } else {
                problems.push(format!("{} is mounted at {}", mount.device, mount.mount_point));
            }
        }
    }

    fn check_passphrase(&self, label: &str, len: usize, problems: &mut Vec<String>) {
        if len < self.min_passphrase_len {
            problems.push(format!(
                "{} passphrase must be at least {} characters",
                label, self.min_passphrase_len
            ));
        } else if len > MAX_PASSPHRASE_LEN {
            problems.push(format!(
                "{} passphrase must be at most {} characters",
                label, MAX_PASSPHRASE_LEN
            ));
        }
    }
}

impl ConfigValidator for SystemValidator {
    fn validate(&self, config: &InstallConfig) -> Vec<String> {
        let mut problems = Vec::new();

        self.check_target(&config.target_disk, &mut problems);
        problems.extend(check_fields(config));
        self.check_passphrase("account", config.account_passphrase.len(), &mut problems);
        self.check_passphrase(
            "disk encryption",
            config.disk_passphrase.len(),
            &mut problems,
        );

        problems
    }
}

/// Syntax checks that need nothing from the machine.
pub fn check_fields(config: &InstallConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if !USERNAME.is_match(&config.username) {
        problems.push(format!("invalid username '{}'", shown(&config.username)));
    }
    if !is_valid_hostname(&config.hostname) {
        problems.push(format!("invalid hostname '{}'", shown(&config.hostname)));
    }
    if !LOCALE.is_match(&config.locale) {
        problems.push(format!("invalid locale '{}'", shown(&config.locale)));
    }
    let tz = &config.timezone;
    if tz.is_empty()
        || tz.len() > MAX_TIMEZONE_LEN
        || tz.contains("..")
        || tz.starts_with('/')
    {
        problems.push(format!("invalid timezone '{}'", shown(tz)));
    }

    problems
}

fn shown(value: &str) -> String {
    truncate_text(value.to_string(), SHOWN_VALUE_BYTES)
}

fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 63
        && !hostname.starts_with('-')
        && !hostname.ends_with('-')
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_common::Secret;
    use std::fs;
    use tempfile::TempDir;

    struct Machine {
        root: TempDir,
    }

    impl Machine {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let disk = root.path().join("sys/block/vda");
            fs::create_dir_all(disk.join("device")).unwrap();
            fs::create_dir_all(disk.join("vda1")).unwrap();
            fs::create_dir_all(disk.join("vda2")).unwrap();
            fs::write(disk.join("device/model"), "QEMU HARDDISK\n").unwrap();
            fs::write(disk.join("size"), "41943040\n").unwrap();
            fs::write(disk.join("ro"), "0\n").unwrap();
            fs::create_dir_all(root.path().join("dev")).unwrap();
            fs::write(root.path().join("dev/vda"), "").unwrap();
            fs::write(root.path().join("mounts"), "proc /proc proc rw 0 0\n").unwrap();
            Self { root }
        }

        fn target(&self) -> String {
            self.root.path().join("dev/vda").to_string_lossy().to_string()
        }

        fn mount(&self, line: &str) {
            fs::write(self.root.path().join("mounts"), line).unwrap();
        }

        fn validator(&self) -> SystemValidator {
            SystemValidator::new(
                DiskProbe::new(self.root.path().join("sys/block"), self.root.path().join("dev")),
                self.root.path().join("mounts"),
                4,
            )
        }

        fn config(&self) -> InstallConfig {
            InstallConfig {
                target_disk: self.target(),
                hostname: "citadel".to_string(),
                locale: "en_US.UTF-8".to_string(),
                timezone: "America/Toronto".to_string(),
                username: "user".to_string(),
                account_passphrase: Secret::new("account"),
                disk_passphrase: Secret::new("diskpass"),
                skip_stages: vec![],
                auto_begin: true,
            }
        }
    }

    #[test]
    fn test_valid_config_has_no_problems() {
        let machine = Machine::new();
        assert!(machine.validator().validate(&machine.config()).is_empty());
    }

    #[test]
    fn test_read_only_mount_is_named() {
        let machine = Machine::new();
        let part = format!("{}2", machine.target());
        machine.mount(&format!("{} /media/usb ext4 ro,relatime 0 0\n", part));

        let problems = machine.validator().validate(&machine.config());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("mounted read-only at /media/usb"));
        assert!(problems[0].contains(&part));
    }

    #[test]
    fn test_missing_disk() {
        let machine = Machine::new();
        let mut config = machine.config();
        config.target_disk = machine.root.path().join("dev/sdz").to_string_lossy().to_string();
        let problems = machine.validator().validate(&config);
        assert!(problems[0].contains("does not exist"));
    }

    #[test]
    fn test_all_problems_reported_together() {
        let machine = Machine::new();
        let mut config = machine.config();
        config.username = "Root User".to_string();
        config.hostname = "-bad-".to_string();
        config.locale = "english".to_string();
        config.timezone = "../etc/shadow".to_string();
        config.disk_passphrase = Secret::new("abc");

        let problems = machine.validator().validate(&config);
        assert_eq!(problems.len(), 5, "{:?}", problems);
    }

    #[test]
    fn test_rejected_values_are_echoed_briefly() {
        let machine = Machine::new();
        let mut config = machine.config();
        config.username = "\u{1}".repeat(20_000);
        config.timezone = "Europe/".repeat(2_000);

        let problems = machine.validator().validate(&config);
        assert_eq!(problems.len(), 2, "{:?}", problems);
        assert!(problems[1].starts_with("invalid timezone"));
        for problem in &problems {
            assert!(problem.len() < 128, "{} bytes", problem.len());
        }
    }

    #[test]
    fn test_passphrase_upper_bound() {
        let machine = Machine::new();
        let mut config = machine.config();
        config.account_passphrase = Secret::new("x".repeat(MAX_PASSPHRASE_LEN + 1));
        let problems = machine.validator().validate(&config);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("at most"));
    }

    #[test]
    fn test_field_rules() {
        assert!(USERNAME.is_match("_svc-1"));
        assert!(!USERNAME.is_match("1user"));
        assert!(!USERNAME.is_match(&"a".repeat(33)));
        assert!(LOCALE.is_match("de_DE"));
        assert!(LOCALE.is_match("sr_RS.UTF-8@latin"));
        assert!(!LOCALE.is_match("en-US"));
        assert!(is_valid_hostname("citadel-01"));
        assert!(!is_valid_hostname("my host"));
    }

    #[test]
    fn test_closure_validator() {
        let always_bad = |_: &InstallConfig| vec!["nope".to_string()];
        let machine = Machine::new();
        assert_eq!(always_bad.validate(&machine.config()), vec!["nope"]);
    }
}
