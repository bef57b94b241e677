//! Engine-wide information and disk usage

use serde::{Deserialize, Serialize};

/// Engine version and host summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub name: Option<String>,
    pub server_version: Option<String>,
    pub operating_system: Option<String>,
    pub architecture: Option<String>,
    pub kernel_version: Option<String>,
    pub storage_driver: Option<String>,
    pub cpus: u64,
    /// Host memory in bytes
    pub memory: u64,
    pub containers: ContainerCounts,
    pub images: u64,
}

/// Container totals by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCounts {
    pub total: u64,
    pub running: u64,
    pub paused: u64,
    pub stopped: u64,
}

/// Space used by one kind of resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub count: u64,
    /// Bytes
    pub total_size: u64,
    /// Bytes held by items nothing uses
    pub reclaimable: u64,
}

impl UsageSummary {
    /// Add one item of `size` bytes
    pub fn add(&mut self, size: u64, in_use: bool) {
        self.count += 1;
        self.total_size += size;
        if !in_use {
            self.reclaimable += size;
        }
    }
}

/// `docker system df` equivalent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub images: UsageSummary,
    pub containers: UsageSummary,
    pub volumes: UsageSummary,
    pub build_cache: UsageSummary,
}
