// Integration tests for the streaming surface: SSE sequence shape, queue
// behaviour under load, and the error envelopes clients actually see.
// Run with: cargo test --test integration_streaming

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::mpsc;

use claudish::anthropic::{SseEmitter, StopReason};
use claudish::error::ProxyError;
use claudish::queue::{GeminiQueue, JobThunk, LocalQueue};

fn parse_frames(frames: &[Bytes]) -> Vec<(String, serde_json::Value)> {
    let mut out = Vec::new();
    for frame in frames {
        let text = std::str::from_utf8(frame).expect("frames are UTF-8");
        if text.starts_with("data: [DONE]") {
            out.push(("done".to_string(), serde_json::Value::Null));
            continue;
        }
        let mut lines = text.lines();
        let event = lines
            .next()
            .and_then(|l| l.strip_prefix("event: "))
            .expect("event line")
            .to_string();
        let data = lines
            .next()
            .and_then(|l| l.strip_prefix("data: "))
            .expect("data line");
        out.push((event, serde_json::from_str(data).expect("compact JSON")));
    }
    out
}

fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<(String, serde_json::Value)> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    parse_frames(&frames)
}

// =============================================================================
// SSE well-formedness
// =============================================================================

/// Every emitted stream has exactly one message_start / message_delta /
/// message_stop, and every block group is well-nested.
#[tokio::test]
async fn sse_stream_shape_invariants() {
    let (tx, mut rx) = mpsc::channel(128);
    let mut emitter = SseEmitter::new(tx);

    emitter.message_start("gpt-4o").await.expect("start");
    emitter.thinking_delta("let me think").await.expect("thinking");
    emitter.text_delta("Hello ").await.expect("text");
    emitter.text_delta("world").await.expect("text");
    emitter.tool_use_start("toolu_1", "search").await.expect("tool");
    emitter.tool_args_delta("{\"q\":\"x\"}").await.expect("args");
    emitter.finish(StopReason::ToolUse, 42).await.expect("finish");

    let events = drain(&mut rx);

    let count = |name: &str| events.iter().filter(|(e, _)| e == name).count();
    assert_eq!(count("message_start"), 1);
    assert_eq!(count("message_delta"), 1);
    assert_eq!(count("message_stop"), 1);
    assert_eq!(count("done"), 1);

    let mut open: Option<i64> = None;
    let mut last_index = -1i64;
    for (event, data) in &events {
        match event.as_str() {
            "content_block_start" => {
                assert!(open.is_none(), "nested block start");
                let index = data["index"].as_i64().expect("index");
                assert_eq!(index, last_index + 1, "indices are dense");
                last_index = index;
                open = Some(index);
            }
            "content_block_delta" => {
                assert_eq!(data["index"].as_i64(), open, "delta outside its block");
            }
            "content_block_stop" => {
                assert_eq!(data["index"].as_i64(), open, "stop outside its block");
                open = None;
            }
            _ => {}
        }
    }
    assert!(open.is_none(), "unclosed block at stream end");
}

/// The message_start placeholder usage is the documented `{100, 1}` pair and
/// the real totals arrive in message_delta.
#[tokio::test]
async fn placeholder_usage_then_real_totals() {
    let (tx, mut rx) = mpsc::channel(64);
    let mut emitter = SseEmitter::new(tx);
    emitter.message_start("m").await.expect("start");
    emitter.text_delta("hi").await.expect("text");
    emitter.finish(StopReason::EndTurn, 7).await.expect("finish");

    let events = drain(&mut rx);
    let (_, start) = events.iter().find(|(e, _)| e == "message_start").expect("start");
    assert_eq!(start["message"]["usage"]["input_tokens"], 100);
    assert_eq!(start["message"]["usage"]["output_tokens"], 1);

    let (_, delta) = events.iter().find(|(e, _)| e == "message_delta").expect("delta");
    assert_eq!(delta["usage"]["output_tokens"], 7);
}

// =============================================================================
// Queue behaviour
// =============================================================================

/// Saturating the local queue past its bound yields the GPU-overloaded error.
#[tokio::test]
async fn local_queue_overflow_is_a_client_visible_error() {
    let queue: Arc<LocalQueue<u32>> = LocalQueue::new(1, true);
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    let mut waiters = Vec::new();
    for _ in 0..101 {
        let queue = Arc::clone(&queue);
        let gate = gate.clone();
        let thunk: JobThunk<u32> = Box::new(move || {
            let gate = gate.clone();
            async move {
                let _permit = gate.acquire().await;
                Ok(1)
            }
            .boxed()
        });
        waiters.push(tokio::spawn(async move {
            queue.enqueue(thunk, "ollama", None).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let thunk: JobThunk<u32> = Box::new(|| async { Ok(1) }.boxed());
    let err = queue
        .enqueue(thunk, "ollama", None)
        .await
        .expect_err("queue should be full");
    let message = err.to_string();
    assert!(message.contains("Local model queue full (100/100)"), "{message}");
    assert!(message.contains("GPU overloaded"), "{message}");

    gate.close();
    for waiter in waiters {
        let _ = waiter.await;
    }
}

/// A 429 with a quotaResetDelay postpones the next admission by at least the
/// suggested delay, and a success resets the error counter.
#[tokio::test]
async fn gemini_backoff_honours_quota_reset_delay() {
    let queue: Arc<GeminiQueue<u32>> = GeminiQueue::with_delays(1, 10_000);

    let thunk: JobThunk<u32> = Box::new(|| {
        async {
            Err(ProxyError::Api {
                status: 429,
                message: r#"{"error":{"details":[{"quotaResetDelay": "0.3s"}]}}"#.into(),
            })
        }
        .boxed()
    });
    let err = queue.enqueue(thunk).await.expect_err("first call is limited");
    assert!(matches!(err, ProxyError::RateLimited(_)));
    assert!(queue.min_delay_ms().await >= 300);
    assert_eq!(queue.consecutive_errors().await, 1);

    let after_first = Instant::now();
    let thunk: JobThunk<u32> = Box::new(|| async { Ok(1) }.boxed());
    queue.enqueue(thunk).await.expect("second call succeeds");
    assert!(
        after_first.elapsed() >= Duration::from_millis(300),
        "second admission arrived too early"
    );
    assert_eq!(queue.consecutive_errors().await, 0);
}

// =============================================================================
// Error envelopes
// =============================================================================

/// Unknown vendors produce the actionable remediation message.
#[test]
fn unknown_vendor_error_is_actionable() {
    let err = ProxyError::UnknownProvider {
        model: "acme/super-1".into(),
    };
    let message = err.to_string();
    assert!(message.contains("openrouter@acme/super-1"), "{message}");
    assert!(message.contains("supported shortcuts"), "{message}");
    assert_eq!(err.status().as_u16(), 400);
    assert_eq!(err.error_type(), "unknown_provider");
}
