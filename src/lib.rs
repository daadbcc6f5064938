//! Credential vault, provider adapters and usage reconciliation for
//! GitHub Copilot and Anthropic Claude accounts.

pub mod config;
pub mod crypto;
#[cfg(feature = "dashboard")]
pub mod dashboard;
pub mod device_flow;
pub mod models;
pub mod providers;
pub mod rate_limit;
pub mod reconcile;
pub mod scheduler;
pub mod store;
#[cfg(test)]
mod testing;
pub mod token;
pub mod ttl_store;
