// Load Average metric collector
//
// Average number of runnable (or I/O-blocked) processes over the last
// 1, 5 and 15 minutes.

use std::error::Error;

use async_trait::async_trait;
use sysinfo::System;
use tracing::debug;

use super::MetricCollector;

/// Load Average metric collector
///
/// # Platform Support
/// - Linux: Full support via /proc/loadavg
/// - macOS: Full support via sysctl
/// - Windows: Not available (reports 0.0)
#[derive(Debug, Default)]
pub struct LoadAverageCollector;

impl LoadAverageCollector {
    pub fn new() -> Self {
        LoadAverageCollector
    }
}

#[async_trait]
impl MetricCollector for LoadAverageCollector {
    fn name(&self) -> &str {
        "LoadAverage"
    }

    async fn collect(&self) -> Result<Vec<(String, f64)>, Box<dyn Error + Send + Sync>> {
        let load_avg = System::load_average();

        debug!(
            "Load average: 1min={:.2}, 5min={:.2}, 15min={:.2}",
            load_avg.one, load_avg.five, load_avg.fifteen
        );

        Ok(vec![
            ("LoadAverage1".to_string(), load_avg.one),
            ("LoadAverage5".to_string(), load_avg.five),
            ("LoadAverage15".to_string(), load_avg.fifteen),
        ])
    }
}
