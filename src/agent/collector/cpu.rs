// CPU utilisation collector
//
// Per-core usage percentage since the previous tick. sysinfo computes usage
// from the difference between two refreshes, so the collector keeps its
// `System` alive across ticks and primes it once at construction.

use std::error::Error;

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::Mutex;

use super::MetricCollector;

pub struct CpuCollector {
    system: Mutex<System>,
}

impl CpuCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        CpuCollector {
            system: Mutex::new(system),
        }
    }
}

#[async_trait]
impl MetricCollector for CpuCollector {
    fn name(&self) -> &str {
        "CPU"
    }

    /// # Returns
    /// `CPUutilization1` through `CPUutilizationN`, one per logical core,
    /// each in the 0-100 range.
    async fn collect(&self) -> Result<Vec<(String, f64)>, Box<dyn Error + Send + Sync>> {
        let mut sys = self.system.lock().await;
        sys.refresh_cpu();

        if sys.cpus().is_empty() {
            return Err("no CPU information available on this platform".into());
        }

        Ok(sys
            .cpus()
            .iter()
            .enumerate()
            .map(|(i, cpu)| (format!("CPUutilization{}", i + 1), cpu.cpu_usage() as f64))
            .collect())
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}
