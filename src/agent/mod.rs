// Agent side of the pipeline: sampling, scheduling and delivery.

pub mod collector;
pub mod scheduler;
pub mod sender;

pub use collector::{create_all_collectors, MetricCollector};
pub use scheduler::{DeliveryMode, MetricScheduler, SchedulerSettings, SchedulerState};
pub use sender::{HttpSender, MetricSender, SendError};
