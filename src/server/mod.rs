//! The proxy HTTP server: `/v1/messages` plus a health probe.

pub mod daemon;
pub mod routes;

pub use daemon::{router, serve};
