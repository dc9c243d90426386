//! Bounded FIFO for GPU-bound local model servers.
//!
//! Local servers fall over when hit with parallel requests: generation slows
//! to a crawl or the GPU runs out of memory outright. The queue admits at
//! most `max_parallel` requests at a time, spaces launches 100 ms apart, and
//! retries a request exactly once when the server reports an OOM-flavoured
//! 500.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::error::{ProxyError, Result};

use super::JobThunk;

/// Hard cap on waiting requests.
const MAX_QUEUE_SIZE: usize = 100;
/// Pause between launches when several slots open at once.
const REQUEST_DELAY: Duration = Duration::from_millis(100);
/// Wait before the single OOM retry.
const OOM_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Upper bound for `max_parallel`, however requested.
const MAX_PARALLEL_CEILING: usize = 8;

/// Body substrings that identify a GPU out-of-memory failure.
const OOM_PHRASES: &[&str] = &[
    "failed to allocate memory",
    "cuda out of memory",
    "oom",
    "out of memory",
    "memory allocation failed",
    "insufficient memory",
    "gpu memory",
];

struct Queued<T> {
    thunk: JobThunk<T>,
    tx: oneshot::Sender<Result<T>>,
    tag: String,
}

struct State<T> {
    queue: VecDeque<Queued<T>>,
    active: usize,
    max_parallel: usize,
    dispatching: bool,
}

/// FIFO with a concurrency cap for local-category providers.
pub struct LocalQueue<T> {
    state: Mutex<State<T>>,
    enabled: bool,
    request_delay: Duration,
    oom_retry_delay: Duration,
}

impl<T: Send + 'static> LocalQueue<T> {
    /// Create a queue with the given parallelism cap (clamped to `[1, 8]`).
    pub fn new(max_parallel: usize, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: 0,
                max_parallel: max_parallel.clamp(1, MAX_PARALLEL_CEILING),
                dispatching: false,
            }),
            enabled,
            request_delay: REQUEST_DELAY,
            oom_retry_delay: OOM_RETRY_DELAY,
        })
    }

    #[cfg(test)]
    fn with_timing(max_parallel: usize, request_delay: Duration, oom_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: 0,
                max_parallel: max_parallel.clamp(1, MAX_PARALLEL_CEILING),
                dispatching: false,
            }),
            enabled: true,
            request_delay,
            oom_retry_delay: oom_delay,
        })
    }

    /// Current parallelism cap.
    pub async fn max_parallel(&self) -> usize {
        self.state.lock().await.max_parallel
    }

    /// Submit a request. Resolves when the request has executed (possibly
    /// after an OOM retry) or been rejected.
    ///
    /// `concurrency_override` of 0 bypasses the queue entirely; a positive
    /// value raises or lowers the process-wide cap before admission.
    pub async fn enqueue(
        self: &Arc<Self>,
        thunk: JobThunk<T>,
        tag: &str,
        concurrency_override: Option<usize>,
    ) -> Result<T> {
        if !self.enabled || concurrency_override == Some(0) {
            return run_with_oom_retry(&thunk, tag, self.oom_retry_delay).await;
        }

        if let Some(n) = concurrency_override {
            let mut state = self.state.lock().await;
            let clamped = n.min(MAX_PARALLEL_CEILING);
            if clamped != state.max_parallel {
                // Process-wide: the new cap applies to every later request,
                // not just this one.
                log::info!(
                    "[LocalQueue] max_parallel {} -> {} (requested by {tag})",
                    state.max_parallel,
                    clamped
                );
                state.max_parallel = clamped;
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.queue.len() >= MAX_QUEUE_SIZE {
                return Err(ProxyError::QueueFull {
                    queued: state.queue.len(),
                    max: MAX_QUEUE_SIZE,
                });
            }
            state.queue.push_back(Queued {
                thunk,
                tx,
                tag: tag.to_string(),
            });
        }
        self.dispatch();

        rx.await
            .unwrap_or_else(|_| Err(ProxyError::Internal("local queue worker dropped".into())))
    }

    /// Launch queued requests while slots are free. A single dispatcher task
    /// runs at a time; it pauses between launches so a burst of freed slots
    /// does not stampede the GPU.
    fn dispatch(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut state = queue.state.lock().await;
                if state.dispatching {
                    return;
                }
                state.dispatching = true;
            }
            loop {
                let job = {
                    let mut state = queue.state.lock().await;
                    if state.queue.is_empty() || state.active >= state.max_parallel {
                        state.dispatching = false;
                        break;
                    }
                    state.active += 1;
                    state.queue.pop_front()
                };
                let Some(job) = job else {
                    queue.state.lock().await.dispatching = false;
                    break;
                };

                let worker = Arc::clone(&queue);
                tokio::spawn(async move {
                    let result =
                        run_with_oom_retry(&job.thunk, &job.tag, worker.oom_retry_delay).await;
                    let _ = job.tx.send(result);
                    {
                        let mut state = worker.state.lock().await;
                        state.active -= 1;
                    }
                    worker.dispatch();
                });

                tokio::time::sleep(queue.request_delay).await;
            }
        });
    }
}

/// Whether an error is an upstream 500 whose body smells like GPU OOM.
fn is_oom(err: &ProxyError) -> bool {
    match err {
        ProxyError::Api { status: 500, message } => {
            let lower = message.to_lowercase();
            OOM_PHRASES.iter().any(|phrase| lower.contains(phrase))
        }
        _ => false,
    }
}

async fn run_with_oom_retry<T>(
    thunk: &JobThunk<T>,
    tag: &str,
    retry_delay: Duration,
) -> Result<T> {
    match thunk().await {
        Err(err) if is_oom(&err) => {
            log::warn!("[LocalQueue] {tag}: GPU OOM, retrying once in {retry_delay:?}");
            tokio::time::sleep(retry_delay).await;
            match thunk().await {
                Err(err2) if is_oom(&err2) => Err(ProxyError::Api {
                    status: 500,
                    message: format!("GPU out of memory persisted after retry: {err2}"),
                }),
                other => other,
            }
        }
        other => other,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
