mod cluster_events;
mod maintenance;

pub use cluster_events::ClusterEventSubscriber;
pub use maintenance::MaintenanceTask;
