//! Proxy configuration: schema plus environment loading.

pub mod loader;
pub mod schema;

pub use loader::{apply_env_overrides, load_config};
pub use schema::{BaseUrls, BillingConfig, ModelMap, ProxyConfig, QueueConfig};
