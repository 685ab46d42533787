// Library interface for the source aggregator.
// The binary and the integration tests both build on these modules.

pub mod app_state;
pub mod bypass;
pub mod cache;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod http_client;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod race;
pub mod scheduler;
pub mod server;
pub mod timeout_governor;
