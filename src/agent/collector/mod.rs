// Collector module - the agent's sampling routine
//
// Each collector reads one family of system values and returns them as
// named gauge samples. The scheduler runs every collector once per poll
// tick and merges the results into a single snapshot.

use std::collections::HashMap;
use std::error::Error;

use async_trait::async_trait;
use tracing::{debug, error, warn};

pub mod cpu;
pub mod load_average;
pub mod memory;
pub mod random;

/// One poll tick worth of raw gauge values, keyed by metric name.
pub type Snapshot = HashMap<String, f64>;

/// Core trait that all metric collectors must implement.
///
/// Collectors only sample; they never talk to the network. Adding a new
/// metric family means implementing this trait and listing the collector
/// in [`create_all_collectors`].
#[async_trait]
pub trait MetricCollector: Send + Sync {
    /// Human-readable collector name, used for logging.
    fn name(&self) -> &str;

    /// Samples the current values.
    ///
    /// # Returns
    /// * `Ok(Vec<(String, f64)>)` - Gauge name and value pairs
    /// * `Err(Box<dyn Error>)` - Sampling failed (e.g. unsupported platform)
    async fn collect(&self) -> Result<Vec<(String, f64)>, Box<dyn Error + Send + Sync>>;
}

/// Instantiates every collector the agent ships with.
pub fn create_all_collectors() -> Vec<Box<dyn MetricCollector>> {
    vec![
        // TotalMemory, FreeMemory, UsedMemory, AvailableMemory, SwapTotal, SwapUsed
        Box::new(memory::MemoryCollector::new()),
        // LoadAverage1, LoadAverage5, LoadAverage15
        Box::new(load_average::LoadAverageCollector::new()),
        // CPUutilization1..N
        Box::new(cpu::CpuCollector::new()),
        Box::new(random::RandomValueCollector),
    ]
}

/// Runs every collector and merges their samples into one snapshot.
///
/// A failing collector is logged and skipped; the rest of the tick
/// still counts. NaN and infinite samples are dropped, since they have no
/// JSON encoding.
pub async fn collect_all(collectors: &[Box<dyn MetricCollector>]) -> Snapshot {
    let mut snapshot = Snapshot::new();

    for collector in collectors {
        match collector.collect().await {
            Ok(samples) => {
                debug!("{} produced {} sample(s)", collector.name(), samples.len());
                for (name, value) in samples {
                    if value.is_finite() {
                        snapshot.insert(name, value);
                    } else {
                        warn!(
                            "Dropping non-finite sample '{}' = {} from '{}'",
                            name,
                            value,
                            collector.name()
                        );
                    }
                }
            }
            Err(e) => {
                error!("Failed to collect metric '{}': {}", collector.name(), e);
            }
        }
    }

    snapshot
}
