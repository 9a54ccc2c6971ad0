//! Boot mode detection.
//!
//! The back-end only makes sense when the machine booted into the live or
//! install environment; both are flagged on the kernel command line.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parsed kernel command line
#[derive(Debug, Clone, Default)]
pub struct KernelCommandLine {
    args: Vec<String>,
}

impl KernelCommandLine {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read kernel command line from {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        Self {
            args: content.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// True if `flag` appears bare or as `flag=<value>`.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| {
            arg == flag
                || arg
                    .strip_prefix(flag)
                    .is_some_and(|rest| rest.starts_with('='))
        })
    }

    /// First of `markers` present on the command line.
    pub fn find_marker<'a>(&self, markers: &'a [String]) -> Option<&'a str> {
        markers
            .iter()
            .find(|m| self.has_flag(m))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: &str = "BOOT_IMAGE=/bzImage root=/dev/mapper/rootfs citadel.live quiet splash\n";

    #[test]
    fn test_detects_live_marker() {
        let cmdline = KernelCommandLine::parse(LIVE);
        let markers = vec!["citadel.install".to_string(), "citadel.live".to_string()];
        assert_eq!(cmdline.find_marker(&markers), Some("citadel.live"));
    }

    #[test]
    fn test_marker_with_value() {
        let cmdline = KernelCommandLine::parse("quiet citadel.install=1");
        assert!(cmdline.has_flag("citadel.install"));
    }

    #[test]
    fn test_prefix_is_not_a_match() {
        let cmdline = KernelCommandLine::parse("citadel.livex citadel.install_extra");
        assert!(!cmdline.has_flag("citadel.live"));
        assert!(!cmdline.has_flag("citadel.install"));
    }

    #[test]
    fn test_normal_boot_has_no_marker() {
        let cmdline = KernelCommandLine::parse("root=/dev/sda2 ro quiet");
        assert_eq!(cmdline.find_marker(&["citadel.live".to_string()]), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmdline");
        fs::write(&path, LIVE).unwrap();
        assert!(KernelCommandLine::load(&path).unwrap().has_flag("citadel.live"));
    }
}
