// Metrics Service - agent and collector for a small telemetry pipeline
//
// The agent samples system gauges, signs, compresses and optionally
// encrypts them, and ships them to the collector service. The collector
// verifies and decodes each request and persists metrics in memory, in a
// JSON snapshot file or in Postgres.
//
// # Binaries
// - `agent`  - see `src/bin/agent.rs`
// - `server` - see `src/bin/server.rs`

pub mod agent;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod retry;
pub mod security;
pub mod server;
pub mod shutdown;
pub mod storage;

pub use error::{MetricError, StorageError};
pub use model::{Metric, MetricKind, MetricValue};
pub use retry::{RetryPolicy, Retryer};
pub use shutdown::shutdown_signal;
