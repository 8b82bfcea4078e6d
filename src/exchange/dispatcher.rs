//! Rate-limited request dispatcher.
//!
//! Every REST call goes through one background loop that drains a FIFO queue
//! under a fixed-window budget (default 90 requests per 60s window, counter
//! reset on the window tick). Admitted calls run concurrently; only admission
//! is serialised. A 429 is retried exactly once after a short delay through a
//! retry lane that is served ahead of the FIFO.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};

use crate::errors::ExchangeError;

use super::transport::{ApiRequest, ApiResponse, HttpTransport};

const HTTP_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_per_window: u32,
    pub window: Duration,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_per_window: 90,
            window: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue with a retry-first lane
// ---------------------------------------------------------------------------

/// Two-lane queue: retries become eligible at their `ready_at` and are then
/// served before anything in the FIFO lane.
#[derive(Debug)]
pub struct DispatchQueue<T> {
    retry: VecDeque<(Instant, T)>,
    fifo: VecDeque<T>,
}

impl<T> Default for DispatchQueue<T> {
    fn default() -> Self {
        Self {
            retry: VecDeque::new(),
            fifo: VecDeque::new(),
        }
    }
}

impl<T> DispatchQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.fifo.push_back(item);
    }

    /// Insert a retry, keeping the lane ordered by readiness.
    pub fn push_retry(&mut self, item: T, ready_at: Instant) {
        let idx = self.retry.partition_point(|(at, _)| *at <= ready_at);
        self.retry.insert(idx, (ready_at, item));
    }

    pub fn has_ready(&self, now: Instant) -> bool {
        self.retry.front().is_some_and(|(at, _)| *at <= now) || !self.fifo.is_empty()
    }

    pub fn pop_ready(&mut self, now: Instant) -> Option<T> {
        if self.retry.front().is_some_and(|(at, _)| *at <= now) {
            return self.retry.pop_front().map(|(_, item)| item);
        }
        self.fifo.pop_front()
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retry.front().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.retry.len() + self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retry.is_empty() && self.fifo.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Fixed-window budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateBudget {
    limit: u32,
    window: Duration,
    window_start: Instant,
    used: u32,
}

impl RateBudget {
    pub fn new(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            window,
            window_start: now,
            used: 0,
        }
    }

    /// Consume one dispatch from the current window if any is left.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.roll(now);
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }

    pub fn next_reset(&self) -> Instant {
        self.window_start + self.window
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window || self.window.is_zero() {
            return;
        }
        let ticks = (elapsed.as_nanos() / self.window.as_nanos()).min(u32::MAX as u128) as u32;
        self.window_start += self.window * ticks;
        self.used = 0;
    }
}

// ---------------------------------------------------------------------------
// Dispatcher loop
// ---------------------------------------------------------------------------

struct Job {
    request: ApiRequest,
    attempts: u32,
    reply: oneshot::Sender<Result<ApiResponse, ExchangeError>>,
}

/// Cloneable submission side of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("path", &self.request.path)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl DispatcherHandle {
    /// Queue a request. The returned future resolves with the response or
    /// the reason it was rejected; queuing itself never fails.
    pub fn enqueue(
        &self,
        request: ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, ExchangeError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let queued = self
            .tx
            .send(Job {
                request,
                attempts: 0,
                reply,
            })
            .is_ok();

        async move {
            if !queued {
                return Err(ExchangeError::Transport("dispatcher stopped".into()));
            }
            rx.await
                .unwrap_or_else(|_| Err(ExchangeError::Transport("dispatcher dropped request".into())))
        }
    }
}

/// Start the dispatcher loop. It runs until every handle is dropped and the
/// queue and every in-flight call have drained.
pub fn spawn_dispatcher(
    transport: Arc<dyn HttpTransport>,
    config: DispatcherConfig,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_dispatcher(transport, config, rx));
    (DispatcherHandle { tx }, task)
}

async fn run_dispatcher(
    transport: Arc<dyn HttpTransport>,
    config: DispatcherConfig,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    tracing::info!(
        max_per_window = config.max_per_window,
        window_secs = config.window.as_secs(),
        "Request dispatcher started"
    );

    let mut queue: DispatchQueue<Job> = DispatchQueue::new();
    let mut budget = RateBudget::new(config.max_per_window, config.window, Instant::now());
    let mut in_flight: JoinSet<(Job, Result<ApiResponse, ExchangeError>)> = JoinSet::new();
    let mut open = true;
    let mut throttled = false;

    loop {
        while let Ok(job) = rx.try_recv() {
            queue.push(job);
        }

        let now = Instant::now();
        let wake = if queue.has_ready(now) {
            if budget.try_acquire(now) {
                throttled = false;
                if let Some(job) = queue.pop_ready(now) {
                    counter!("dispatch_requests_total").increment(1);
                    let transport = Arc::clone(&transport);
                    in_flight.spawn(async move {
                        let result = transport.execute(&job.request).await;
                        (job, result)
                    });
                }
                continue;
            }
            if !throttled {
                throttled = true;
                tracing::warn!(
                    queued = queue.len(),
                    used = budget.used(),
                    "Request budget exhausted — waiting for next window"
                );
            }
            budget.next_reset()
        } else {
            if !open && queue.is_empty() && in_flight.is_empty() {
                break;
            }
            let poll = now + config.poll_interval;
            queue.next_retry_at().map_or(poll, |at| poll.min(at))
        };

        tokio::select! {
            job = rx.recv(), if open => match job {
                Some(job) => queue.push(job),
                None => open = false,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                Ok((job, result)) => settle(job, result, &mut queue, &config),
                Err(e) => tracing::error!(error = %e, "Dispatch task failed"),
            },
            _ = sleep_until(wake) => {}
        }
    }

    tracing::info!("Request dispatcher stopped");
}

/// Route a finished call: answer the caller, or park a first 429 in the
/// retry lane.
fn settle(
    mut job: Job,
    result: Result<ApiResponse, ExchangeError>,
    queue: &mut DispatchQueue<Job>,
    config: &DispatcherConfig,
) {
    match result {
        Ok(resp) if resp.is_success() => {
            let _ = job.reply.send(Ok(resp));
        }
        Ok(resp) if resp.status == HTTP_TOO_MANY_REQUESTS => {
            counter!("dispatch_rate_limited_total").increment(1);
            if job.attempts == 0 {
                tracing::warn!(
                    path = %job.request.path,
                    delay_ms = config.retry_delay.as_millis() as u64,
                    "Rate limited by exchange — retrying once"
                );
                job.attempts += 1;
                queue.push_retry(job, Instant::now() + config.retry_delay);
            } else {
                tracing::error!(path = %job.request.path, "Rate limited again — giving up");
                let _ = job.reply.send(Err(ExchangeError::RateLimited));
            }
        }
        Ok(resp) => {
            tracing::warn!(
                path = %job.request.path,
                status = resp.status,
                "Exchange request failed"
            );
            let _ = job.reply.send(Err(ExchangeError::Api {
                status: resp.status,
                body: resp.body,
            }));
        }
        Err(e) => {
            tracing::warn!(path = %job.request.path, error = %e, "Exchange transport error");
            let _ = job.reply.send(Err(e));
        }
    }
}
