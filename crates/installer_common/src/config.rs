//! Install parameters supplied by the front-end with `StartInstall`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A passphrase or other secret value.
///
/// Travels client to daemon inside `StartInstall` and nowhere else. `Debug`
/// never prints the value, and views handed back to clients use
/// [`InstallSummary`], which has no secret fields.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret::new(value)
    }
}

fn default_auto_begin() -> bool {
    true
}

/// Parameters of one install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Target block device, e.g. `/dev/sda`
    pub target_disk: String,

    /// System hostname
    pub hostname: String,

    /// Locale, e.g. `en_US.UTF-8`
    pub locale: String,

    /// Timezone, e.g. `America/Toronto`
    pub timezone: String,

    /// Login account to create
    pub username: String,

    /// Passphrase for the login account
    pub account_passphrase: Secret,

    /// Passphrase for full-disk encryption
    pub disk_passphrase: Secret,

    /// Skippable stages the user opted out of
    #[serde(default)]
    pub skip_stages: Vec<String>,

    /// Start running stages as soon as the session is configured
    #[serde(default = "default_auto_begin")]
    pub auto_begin: bool,
}

impl InstallConfig {
    pub fn summary(&self) -> InstallSummary {
        InstallSummary {
            target_disk: self.target_disk.clone(),
            hostname: self.hostname.clone(),
            locale: self.locale.clone(),
            timezone: self.timezone.clone(),
            username: self.username.clone(),
            skip_stages: self.skip_stages.clone(),
        }
    }
}

/// Secret-free copy of [`InstallConfig`] included in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSummary {
    pub target_disk: String,
    pub hostname: String,
    pub locale: String,
    pub timezone: String,
    pub username: String,
    pub skip_stages: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstallConfig {
        InstallConfig {
            target_disk: "/dev/sda".to_string(),
            hostname: "citadel".to_string(),
            locale: "en_US.UTF-8".to_string(),
            timezone: "UTC".to_string(),
            username: "user".to_string(),
            account_passphrase: Secret::new("hunter22"),
            disk_passphrase: Secret::new("correct horse"),
            skip_stages: vec![],
            auto_begin: true,
        }
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", sample());
        assert!(!debug.contains("hunter22"));
        assert!(!debug.contains("correct horse"));
        assert!(debug.contains("Secret(***)"));
    }

    #[test]
    fn test_summary_has_no_secrets() {
        let json = serde_json::to_string(&sample().summary()).unwrap();
        assert!(!json.contains("hunter22"));
        assert!(!json.contains("correct horse"));
        assert!(json.contains("/dev/sda"));
    }

    #[test]
    fn test_auto_begin_defaults_true() {
        let json = r#"{
            "target_disk": "/dev/vda",
            "hostname": "h",
            "locale": "C",
            "timezone": "UTC",
            "username": "u",
            "account_passphrase": "a",
            "disk_passphrase": "b"
        }"#;
        let config: InstallConfig = serde_json::from_str(json).unwrap();
        assert!(config.auto_begin);
        assert!(config.skip_stages.is_empty());
        assert_eq!(config.disk_passphrase.expose(), "b");
    }

    #[test]
    fn test_secret_len_counts_chars() {
        assert_eq!(Secret::new("pässword").len(), 8);
        assert!(Secret::default().is_empty());
    }
}
