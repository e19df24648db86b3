// Memory metric collector
//
// RAM and swap totals, reported in bytes as gauges.

use std::error::Error;

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::debug;

use super::MetricCollector;

/// Memory usage metric collector
///
/// # Platform Support
/// - Linux: Full support via /proc/meminfo
/// - macOS: Full support via vm_stat
/// - Windows: Full support via GlobalMemoryStatusEx
pub struct MemoryCollector {
    /// Reused between ticks; only the memory section is refreshed
    system: Mutex<System>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        MemoryCollector {
            system: Mutex::new(System::new()),
        }
    }

    fn bytes_to_mb(bytes: u64) -> u64 {
        bytes / (1024 * 1024)
    }
}

#[async_trait]
impl MetricCollector for MemoryCollector {
    fn name(&self) -> &str {
        "Memory"
    }

    async fn collect(&self) -> Result<Vec<(String, f64)>, Box<dyn Error + Send + Sync>> {
        let mut sys = self.system.lock().await;
        sys.refresh_memory();

        let total = sys.total_memory();
        let used = sys.used_memory();

        debug!(
            "Memory: {}/{} MB, Swap: {}/{} MB",
            Self::bytes_to_mb(used),
            Self::bytes_to_mb(total),
            Self::bytes_to_mb(sys.used_swap()),
            Self::bytes_to_mb(sys.total_swap())
        );

        Ok(vec![
            ("TotalMemory".to_string(), total as f64),
            ("FreeMemory".to_string(), sys.free_memory() as f64),
            ("UsedMemory".to_string(), used as f64),
            ("AvailableMemory".to_string(), sys.available_memory() as f64),
            ("SwapTotal".to_string(), sys.total_swap() as f64),
            ("SwapUsed".to_string(), sys.used_swap() as f64),
        ])
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}
