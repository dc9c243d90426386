//! Request schedulers.
//!
//! Two gates sit between the proxy endpoint and outbound HTTP:
//! - [`local::LocalQueue`] caps parallelism against GPU-bound local servers
//!   and retries once on out-of-memory;
//! - [`gemini::GeminiQueue`] serializes Gemini calls and adapts its pacing to
//!   the quota hints Gemini returns on 429s.

pub mod gemini;
pub mod local;

use futures::future::BoxFuture;

use crate::error::Result;

/// A re-callable outbound request. Re-invocation builds a fresh HTTP request,
/// which is what makes retries safe.
pub type JobThunk<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

pub use gemini::GeminiQueue;
pub use local::LocalQueue;
