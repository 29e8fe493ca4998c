// Session state and replication
pub mod cache;
pub mod clock;
pub mod manager;
pub mod ownership;
pub mod request;
pub mod session;
pub mod snapshot;

// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;

// Admin surface
pub mod api;
pub mod server;

// Supporting modules
pub mod shutdown;
pub mod tasks;
