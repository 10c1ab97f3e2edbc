use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::api::{Api, Endpoint};
use crate::config::PublishConfig;
use crate::transport::Transport;
use crate::worker::WorkerState;

/// A payload waiting in the publish queue
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundTask {
    pub endpoint: Endpoint,
    pub payload: Value,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

impl OutboundTask {
    pub fn new(endpoint: Endpoint, payload: Value) -> Self {
        Self {
            endpoint,
            payload,
            attempts: 0,
        }
    }
}

/// Counters tracking the publish queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishMetrics {
    /// Tasks ever added to the queue
    pub queued: u64,
    /// Tasks successfully published
    pub delivered: u64,
    /// Delivery attempts that failed and were retried or given up on
    pub failed_attempts: u64,
    /// Tasks handed to the dead-letter handler
    pub dead_lettered: u64,
}

impl PublishMetrics {
    /// Tasks still waiting in the queue or being delivered
    pub fn pending(&self) -> u64 {
        self.queued.saturating_sub(self.delivered + self.dead_lettered)
    }
}

/// Receives tasks that exhausted `max_attempts`
pub type DeadLetterHandler = Arc<dyn Fn(OutboundTask) + Send + Sync>;

struct Shared<T> {
    api: Arc<Api<T>>,
    state: WorkerState,
    queue_tx: mpsc::UnboundedSender<OutboundTask>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OutboundTask>>,
    metrics: watch::Sender<PublishMetrics>,
    dead_letter: Mutex<Option<DeadLetterHandler>>,
}

/// Background worker draining the publish queue.
///
/// Producers never block: the queue is unbounded and `enqueue` always
/// succeeds. A single consumer loop publishes tasks in FIFO order and moves
/// failed ones to the back of the queue.
pub(crate) struct PublishWorker<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> PublishWorker<T> {
    pub fn new(api: Arc<Api<T>>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (metrics, _) = watch::channel(PublishMetrics::default());
        Self {
            shared: Arc::new(Shared {
                api,
                state: WorkerState::default(),
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                metrics,
                dead_letter: Mutex::new(None),
            }),
        }
    }

    pub fn enqueue(&self, task: OutboundTask) {
        self.shared.metrics.send_modify(|m| m.queued += 1);
        self.shared.requeue(task);
    }

    /// Start the consumer loop unless it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if self.shared.state.start() {
            tokio::spawn(run(self.shared.clone()));
        }
    }

    /// Ask the consumer loop to exit once the queue is idle.
    pub fn stop(&self) {
        self.shared.state.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.is_running()
    }

    pub fn metrics(&self) -> watch::Receiver<PublishMetrics> {
        self.shared.metrics.subscribe()
    }

    pub fn set_dead_letter_handler(&self, handler: DeadLetterHandler) {
        *self
            .shared
            .dead_letter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

impl<T: Transport> Shared<T> {
    fn requeue(&self, task: OutboundTask) {
        // the receiving half lives as long as `self`, so this cannot fail
        if let Err(mpsc::error::SendError(task)) = self.queue_tx.send(task) {
            error!(endpoint = %task.endpoint, "publish queue closed, task lost");
        }
    }

    async fn deliver(&self, mut task: OutboundTask, backoff: &mut Backoff) {
        match self
            .api
            .post(task.endpoint.as_str(), &task.payload, None)
            .await
        {
            Ok(_) => {
                debug!(endpoint = %task.endpoint, "published {}", task.payload);
                backoff.reset();
                self.metrics.send_modify(|m| m.delivered += 1);
            }
            Err(e) => {
                task.attempts += 1;
                error!(endpoint = %task.endpoint, attempts = task.attempts, "publish failed: {e}");
                self.metrics.send_modify(|m| m.failed_attempts += 1);

                let max_attempts = self.api.config().publish.max_attempts;
                if max_attempts.is_some_and(|max| task.attempts >= max) {
                    self.give_up(task);
                } else {
                    self.requeue(task);
                }

                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }

    fn give_up(&self, task: OutboundTask) {
        warn!(
            endpoint = %task.endpoint,
            attempts = task.attempts,
            "giving up on {}",
            task.payload
        );
        self.metrics.send_modify(|m| m.dead_lettered += 1);
        let handler = self
            .dead_letter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(task);
        }
    }
}

#[instrument(name = "publish", skip_all)]
async fn run<T: Transport>(shared: Arc<Shared<T>>) {
    info!("start publisher");

    debug!("perform connection test before entering worker loop");
    if let Err(e) = shared
        .api
        .post(Endpoint::Telemetry.as_str(), &json!({}), None)
        .await
    {
        error!("connection test failed, exit publisher: {e}");
        shared.state.abort();
        return;
    }
    debug!("connection test successful");

    let config = &shared.api.config().publish;
    let mut backoff = Backoff::new(config);
    let mut queue = shared.queue_rx.lock().await;
    loop {
        let task = match tokio::time::timeout(config.poll_interval, queue.recv()).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                shared.state.abort();
                break;
            }
            Err(_) => {
                if shared.state.stop_requested() && !shared.state.finish() {
                    break;
                }
                continue;
            }
        };

        shared.deliver(task, &mut backoff).await;
    }

    info!("stop publisher");
}

/// Pause applied after failed deliveries.
///
/// Doubles after every consecutive failure, from the configured minimum up
/// to the maximum, and goes back to the minimum after a success.
struct Backoff {
    min: Duration,
    max: Duration,
    max_jitter: Duration,
    current: Duration,
}

impl Backoff {
    fn new(config: &PublishConfig) -> Self {
        Self {
            min: config.retry_min_backoff,
            max: config.retry_max_backoff.max(config.retry_min_backoff),
            max_jitter: config.retry_max_jitter,
            current: config.retry_min_backoff,
        }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);

        let max_jitter_ms = self.max_jitter.as_millis() as u64;
        if max_jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::random_range(0..=max_jitter_ms))
    }
}
