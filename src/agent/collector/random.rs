use std::error::Error;

use async_trait::async_trait;

use super::MetricCollector;

/// Emits `RandomValue`, a uniform sample in `[0, 1)`. Handy for spotting
/// whether fresh snapshots are reaching the server at all.
#[derive(Debug, Default)]
pub struct RandomValueCollector;

#[async_trait]
impl MetricCollector for RandomValueCollector {
    fn name(&self) -> &str {
        "RandomValue"
    }

    async fn collect(&self) -> Result<Vec<(String, f64)>, Box<dyn Error + Send + Sync>> {
        Ok(vec![("RandomValue".to_string(), rand::random::<f64>())])
    }
}
