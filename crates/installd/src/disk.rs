//! Block device discovery and mount table inspection.
//!
//! Disks come from sysfs: every `/sys/block/<name>` entry with a
//! `device/model` file is a physical disk and a candidate install target.
//! Loop, ram and device-mapper nodes have no model and are left out.

use anyhow::{Context, Result};
use installer_common::DiskInfo;
use std::fs;
use std::path::{Path, PathBuf};

const SECTOR_SIZE: u64 = 512;

/// Reads disk information from a sysfs tree.
#[derive(Debug, Clone)]
pub struct DiskProbe {
    sys_block: PathBuf,
    dev_dir: PathBuf,
}

impl DiskProbe {
    pub fn new(sys_block: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_dir: dev_dir.into(),
        }
    }

    /// All candidate disks, sorted by device path.
    pub fn list(&self) -> Result<Vec<DiskInfo>> {
        let entries = fs::read_dir(&self.sys_block)
            .with_context(|| format!("failed to read {}", self.sys_block.display()))?;

        let mut disks = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(disk) = self.describe(&name) {
                disks.push(disk);
            }
        }
        disks.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(disks)
    }

    /// Disk behind a device path such as `/dev/sda`, if it is a whole disk.
    pub fn lookup(&self, device: &str) -> Option<DiskInfo> {
        let name = self.device_name(device)?;
        self.describe(name)
    }

    /// Device paths of the partitions of `device`.
    pub fn partitions(&self, device: &str) -> Vec<String> {
        let Some(name) = self.device_name(device) else {
            return Vec::new();
        };
        let Ok(entries) = fs::read_dir(self.sys_block.join(name)) else {
            return Vec::new();
        };

        let mut parts: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|child| child.starts_with(name) && child.len() > name.len())
            .map(|child| self.dev_dir.join(child).to_string_lossy().to_string())
            .collect();
        parts.sort();
        parts
    }

    /// Strip the device directory from `device`, rejecting nested paths.
    fn device_name<'a>(&self, device: &'a str) -> Option<&'a str> {
        let name = Path::new(device)
            .strip_prefix(&self.dev_dir)
            .ok()?
            .to_str()?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(name)
    }

    fn describe(&self, name: &str) -> Option<DiskInfo> {
        let dir = self.sys_block.join(name);
        let model = read_trimmed(&dir.join("device/model"))?;
        let dev_path = self.dev_dir.join(name);
        if !dev_path.exists() {
            return None;
        }

        let sectors: u64 = read_trimmed(&dir.join("size"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Some(DiskInfo {
            path: dev_path.to_string_lossy().to_string(),
            model,
            size_bytes: sectors * SECTOR_SIZE,
            size_display: format!("{}G", sectors >> 21),
            removable: read_flag(&dir.join("removable")),
            read_only: read_flag(&dir.join("ro")),
        })
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_flag(path: &Path) -> bool {
    read_trimmed(path).is_some_and(|v| v == "1")
}

// ============================================================================
// Mount table
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub read_only: bool,
}

/// Parsed `/proc/self/mounts`.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read mount table {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount_point = fields.next()?;
                let _fstype = fields.next()?;
                let options = fields.next()?;
                Some(MountEntry {
                    device: unescape_octal(device),
                    mount_point: unescape_octal(mount_point),
                    read_only: options.split(',').any(|o| o == "ro"),
                })
            })
            .collect();
        Self { entries }
    }

    /// Mounts whose source is one of `devices`.
    pub fn mounts_of<'a>(&'a self, devices: &'a [String]) -> impl Iterator<Item = &'a MountEntry> {
        self.entries
            .iter()
            .filter(move |e| devices.iter().any(|d| *d == e.device))
    }
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}
