//! Candidate install targets reported by `ListDisks`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Device node, e.g. `/dev/nvme0n1`
    pub path: String,
    pub model: String,
    pub size_bytes: u64,
    /// Size rounded down to whole GiB, e.g. `238G`
    pub size_display: String,
    pub removable: bool,
    pub read_only: bool,
}
