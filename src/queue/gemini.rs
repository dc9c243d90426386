//! Serialized, backoff-aware queue for Gemini.
//!
//! Gemini's free-tier quota punishes parallelism, so at most one call is in
//! flight at any time and consecutive calls are spaced by an adaptive delay.
//! When a 429 arrives, its `quotaResetDelay` detail (a string like
//! `"2.893s"`) raises the floor; successes decay it back towards the base.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

use crate::error::{ProxyError, Result};

use super::JobThunk;

/// Hard cap on waiting requests.
const MAX_QUEUE_SIZE: usize = 100;
/// Starting and minimum inter-request delay.
const BASE_DELAY_MS: u64 = 1_000;
/// Ceiling for the adaptive delay.
const MAX_DELAY_MS: u64 = 10_000;

struct Queued<T> {
    thunk: JobThunk<T>,
    tx: oneshot::Sender<Result<T>>,
}

struct State<T> {
    queue: VecDeque<Queued<T>>,
    processing: bool,
    min_delay_ms: u64,
    last_request_at: Option<Instant>,
    consecutive_errors: u32,
}

/// Single-worker FIFO with adaptive rate-limit backoff.
pub struct GeminiQueue<T> {
    state: Mutex<State<T>>,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl<T: Send + 'static> GeminiQueue<T> {
    pub fn new() -> Arc<Self> {
        Self::with_delays(BASE_DELAY_MS, MAX_DELAY_MS)
    }

    /// Delay bounds are injectable so tests run at millisecond scale.
    pub fn with_delays(base_delay_ms: u64, max_delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                processing: false,
                min_delay_ms: base_delay_ms,
                last_request_at: None,
                consecutive_errors: 0,
            }),
            base_delay_ms,
            max_delay_ms,
        })
    }

    /// Current adaptive delay floor, for introspection and tests.
    pub async fn min_delay_ms(&self) -> u64 {
        self.state.lock().await.min_delay_ms
    }

    /// 429s seen since the last success.
    pub async fn consecutive_errors(&self) -> u32 {
        self.state.lock().await.consecutive_errors
    }

    /// Submit a Gemini call; resolves once the call has actually run.
    pub async fn enqueue(self: &Arc<Self>, thunk: JobThunk<T>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.queue.len() >= MAX_QUEUE_SIZE {
                return Err(ProxyError::RateLimited(format!(
                    "Gemini request queue full ({}/{})",
                    state.queue.len(),
                    MAX_QUEUE_SIZE
                )));
            }
            state.queue.push_back(Queued { thunk, tx });
        }
        self.ensure_worker();

        rx.await
            .unwrap_or_else(|_| Err(ProxyError::Internal("gemini queue worker dropped".into())))
    }

    /// Spawn the worker loop unless one is already draining the queue.
    fn ensure_worker(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut state = queue.state.lock().await;
                if state.processing {
                    return;
                }
                state.processing = true;
            }
            loop {
                // Wait out the pacing delay without holding the lock.
                let wait = {
                    let state = queue.state.lock().await;
                    if state.queue.is_empty() {
                        None
                    } else {
                        Some(queue.remaining_delay(&state))
                    }
                };
                match wait {
                    None => {
                        queue.state.lock().await.processing = false;
                        return;
                    }
                    Some(d) if !d.is_zero() => {
                        tokio::time::sleep(d).await;
                        continue;
                    }
                    Some(_) => {}
                }

                let job = queue.state.lock().await.queue.pop_front();
                let Some(job) = job else { continue };

                let result = (job.thunk)().await;
                {
                    let mut state = queue.state.lock().await;
                    state.last_request_at = Some(Instant::now());
                    queue.record_outcome(&mut state, &result);
                }
                let _ = job.tx.send(map_rate_limit(result));
            }
        });
    }

    fn remaining_delay(&self, state: &State<T>) -> Duration {
        let factor = 1.0 + 0.5 * state.consecutive_errors as f64;
        let effective =
            ((state.min_delay_ms as f64 * factor) as u64).min(self.max_delay_ms);
        match state.last_request_at {
            Some(at) => Duration::from_millis(effective).saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn record_outcome(&self, state: &mut State<T>, result: &Result<T>) {
        match result {
            Ok(_) => {
                if state.consecutive_errors > 0 {
                    log::info!(
                        "[GeminiQueue] recovered after {} rate-limit errors",
                        state.consecutive_errors
                    );
                    state.consecutive_errors = 0;
                }
                state.min_delay_ms = self
                    .base_delay_ms
                    .max((state.min_delay_ms as f64 * 0.9) as u64);
            }
            Err(ProxyError::Api { status: 429, message }) => {
                state.consecutive_errors += 1;
                if let Some(seconds) = parse_quota_reset_delay(message) {
                    let suggested = (seconds * 1000.0).ceil() as u64;
                    let raised = suggested
                        .max(state.min_delay_ms)
                        .max(self.base_delay_ms)
                        .min(self.max_delay_ms);
                    log::warn!(
                        "[GeminiQueue] 429 with quotaResetDelay {seconds}s; delay {} -> {raised} ms",
                        state.min_delay_ms
                    );
                    state.min_delay_ms = raised;
                } else {
                    log::warn!(
                        "[GeminiQueue] 429 without quotaResetDelay (errors={})",
                        state.consecutive_errors
                    );
                }
            }
            Err(_) => {}
        }
    }
}

/// A 429 that reaches the caller is reported as rate limiting, not as a
/// generic upstream error.
fn map_rate_limit<T>(result: Result<T>) -> Result<T> {
    match result {
        Err(ProxyError::Api { status: 429, message }) => Err(ProxyError::RateLimited(message)),
        other => other,
    }
}

/// Extract the seconds value of a `quotaResetDelay` detail from a 429 body,
/// e.g. `"quotaResetDelay": "2.893s"` → `2.893`.
fn parse_quota_reset_delay(body: &str) -> Option<f64> {
    let idx = body.find("quotaResetDelay")?;
    let rest = &body[idx + "quotaResetDelay".len()..];
    let colon = rest.find(':')?;
    let after = rest[colon + 1..].trim_start().trim_start_matches('"');
    let end = after
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(after.len());
    let (number, tail) = after.split_at(end);
    if !tail.starts_with('s') {
        return None;
    }
    number.parse::<f64>().ok()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
