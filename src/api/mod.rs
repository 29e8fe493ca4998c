//! Admin API - observes and administers the session manager.

mod health;
mod metrics;
mod routes;
mod sessions;

pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
pub use sessions::{get_session, list_sessions, run_maintenance};
