// Scheduler module - drives periodic collection and delivery
//
// Two independent loops share one piece of mutable state, the latest
// snapshot plus the poll counter, behind a single mutex:
//
// - collect loop: every poll interval, samples all collectors (outside the
//   lock) and swaps the new snapshot in, bumping PollCount
// - report loop: every report interval, clones the state under the lock
//   and delivers it with the lock released, either as one batch or through
//   a pool of per-metric workers
//
// PollCount is only reduced after the server confirmed a delivery, and only
// by the amount that was actually delivered, so polls that happen while a
// send is in flight are never lost.
//
// Shutdown is cooperative: a CancellationToken stops every loop, in-flight
// sends run to completion, and `run` returns once every task has exited.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::collector::{collect_all, MetricCollector, Snapshot};
use super::sender::{MetricSender, SendError};
use crate::model::{Metric, MetricValue, POLL_COUNT};

/// Capacity of the producer -> worker queue.
const QUEUE_CAPACITY: usize = 50;

/// How snapshots leave the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// One `POST /updates` per report tick
    #[default]
    Batch,

    /// One `POST /update` per metric, spread over `rate_limit` workers
    WorkerPool,
}

/// Scheduler lifecycle, observable through [`MetricScheduler::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub mode: DeliveryMode,

    /// Number of concurrent workers in worker-pool mode
    pub rate_limit: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            mode: DeliveryMode::Batch,
            rate_limit: 1,
        }
    }
}

/// The only state shared between the collect and report loops.
#[derive(Debug, Default)]
struct AgentState {
    gauges: Snapshot,
    poll_count: i64,
}

impl AgentState {
    fn record(&mut self, snapshot: Snapshot) {
        self.gauges = snapshot;
        self.poll_count = self.poll_count.saturating_add(1);
    }

    /// Current snapshot as wire metrics, gauges sorted by name, PollCount last.
    fn metrics(&self) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .gauges
            .iter()
            .map(|(name, value)| Metric::gauge(name.clone(), *value))
            .collect();
        metrics.sort_by(|a, b| a.id.cmp(&b.id));
        metrics.push(Metric::counter(POLL_COUNT, self.poll_count));
        metrics
    }

    /// Subtracts a confirmed PollCount delivery.
    fn acknowledge(&mut self, delivered: i64) {
        self.poll_count = self.poll_count.saturating_sub(delivered).max(0);
    }
}

/// Agent scheduler
///
/// Owns the collectors, the sender and the shared state. Tasks spawned by
/// [`run`](Self::run) hold clones of the inner `Arc`s, so the scheduler
/// itself can be borrowed.
pub struct MetricScheduler {
    settings: SchedulerSettings,
    collectors: Arc<Vec<Box<dyn MetricCollector>>>,
    sender: Arc<dyn MetricSender>,
    state: Arc<Mutex<AgentState>>,
    status: watch::Sender<SchedulerState>,
}

impl MetricScheduler {
    /// Creates an idle scheduler.
    ///
    /// # Arguments
    /// * `settings` - Intervals, delivery mode and worker count
    /// * `collectors` - Sampling routines run on every poll tick
    /// * `sender` - Delivery backend
    pub fn new(
        settings: SchedulerSettings,
        collectors: Vec<Box<dyn MetricCollector>>,
        sender: Arc<dyn MetricSender>,
    ) -> Self {
        let (status, _) = watch::channel(SchedulerState::Idle);
        MetricScheduler {
            settings,
            collectors: Arc::new(collectors),
            sender,
            state: Arc::new(Mutex::new(AgentState::default())),
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.status.subscribe()
    }

    pub async fn poll_count(&self) -> i64 {
        self.state.lock().await.poll_count
    }

    /// Runs one collection tick.
    pub async fn collect_once(&self) {
        collect_tick(&self.collectors, &self.state).await;
    }

    /// Runs one batch delivery tick.
    ///
    /// # Returns
    /// * `Ok(())` - Delivered; PollCount was reduced by the delivered amount
    /// * `Err(SendError)` - Nothing changed; the next tick resends
    pub async fn report_once(&self) -> Result<(), SendError> {
        report_batch(self.sender.as_ref(), &self.state).await
    }

    /// Runs both loops until `cancel` fires, then waits for every task.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Starting scheduler: poll every {:?}, report every {:?}, mode {:?}",
            self.settings.poll_interval, self.settings.report_interval, self.settings.mode
        );
        self.status.send_replace(SchedulerState::Running);

        let mut handles = vec![self.spawn_collect_loop(cancel.clone())];
        match self.settings.mode {
            DeliveryMode::Batch => handles.push(self.spawn_batch_loop(cancel.clone())),
            DeliveryMode::WorkerPool => handles.extend(self.spawn_worker_pool(cancel.clone())),
        }

        cancel.cancelled().await;
        info!("Scheduler stopping, waiting for in-flight deliveries");
        self.status.send_replace(SchedulerState::Stopping);

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Scheduler task panicked: {}", e);
            }
        }

        self.status.send_replace(SchedulerState::Stopped);
        info!("Scheduler stopped");
    }

    fn spawn_collect_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let collectors = Arc::clone(&self.collectors);
        let state = Arc::clone(&self.state);
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            while tick(&mut ticker, &cancel).await {
                collect_tick(&collectors, &state).await;
            }
            debug!("Collect loop exited");
        })
    }

    fn spawn_batch_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sender = Arc::clone(&self.sender);
        let state = Arc::clone(&self.state);
        let mut ticker = self.report_ticker();

        tokio::spawn(async move {
            while tick(&mut ticker, &cancel).await {
                if let Err(e) = report_batch(sender.as_ref(), &state).await {
                    error!("Failed to deliver metrics batch: {}", e);
                }
            }
            debug!("Batch loop exited");
        })
    }

    /// Spawns the producer, `rate_limit` workers and the error drain.
    ///
    /// Shutdown order: the producer and workers stop on `cancel`; once the
    /// last worker drops its error sender the drain finishes too.
    fn spawn_worker_pool(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let (queue_tx, queue_rx) = mpsc::channel::<Metric>(QUEUE_CAPACITY);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<SendError>();

        let mut handles = Vec::new();

        let state = Arc::clone(&self.state);
        let mut ticker = self.report_ticker();
        let producer_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            'ticks: while tick(&mut ticker, &producer_cancel).await {
                let metrics = state.lock().await.metrics();
                for metric in metrics {
                    tokio::select! {
                        _ = producer_cancel.cancelled() => break 'ticks,
                        sent = queue_tx.send(metric) => {
                            if sent.is_err() {
                                break 'ticks;
                            }
                        }
                    }
                }
            }
            debug!("Producer exited");
        }));

        let workers = self.settings.rate_limit.max(1);
        for id in 0..workers {
            let queue_rx = Arc::clone(&queue_rx);
            let sender = Arc::clone(&self.sender);
            let state = Arc::clone(&self.state);
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = async { queue_rx.lock().await.recv().await } => next,
                    };
                    let Some(metric) = next else { break };

                    match sender.send_one(&metric).await {
                        Ok(()) => {
                            if let (POLL_COUNT, MetricValue::Counter(delivered)) =
                                (metric.id.as_str(), metric.value)
                            {
                                state.lock().await.acknowledge(delivered);
                            }
                        }
                        Err(e) => {
                            if err_tx.send(e).is_err() {
                                warn!("Worker {}: error channel closed", id);
                            }
                        }
                    }
                }
                debug!("Worker {} exited", id);
            }));
        }
        drop(err_tx);

        handles.push(tokio::spawn(async move {
            while let Some(e) = err_rx.recv().await {
                error!("Failed to deliver metric: {}", e);
            }
        }));

        info!("Started worker pool with {} worker(s)", workers);
        handles
    }

    /// Report ticks start one full interval after startup, so the first
    /// delivery already carries collected data.
    fn report_ticker(&self) -> Interval {
        let period = self.settings.report_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

/// Waits for the next tick; `false` once cancelled.
async fn tick(ticker: &mut Interval, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = ticker.tick() => true,
    }
}

async fn collect_tick(collectors: &[Box<dyn MetricCollector>], state: &Mutex<AgentState>) {
    let snapshot = collect_all(collectors).await;
    let mut state = state.lock().await;
    state.record(snapshot);
    debug!(
        "Collected {} gauge(s), poll count {}",
        state.gauges.len(),
        state.poll_count
    );
}

async fn report_batch(sender: &dyn MetricSender, state: &Mutex<AgentState>) -> Result<(), SendError> {
    let (metrics, polls) = {
        let state = state.lock().await;
        (state.metrics(), state.poll_count)
    };

    sender.send_batch(&metrics).await?;

    state.lock().await.acknowledge(polls);
    debug!("Delivered {} metric(s)", metrics.len());
    Ok(())
}
