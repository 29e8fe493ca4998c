use crate::config::{PassivationConfig, ReplicationConfig, SessionConfig, Settings};

/// Settings the session manager runs with
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub session: SessionConfig,
    pub replication: ReplicationConfig,
    pub passivation: PassivationConfig,
    /// Upper bound on waiting for session ownership, 0 waits forever
    pub ownership_timeout_ms: u64,
    /// Route suffix appended to client-visible ids
    pub jvm_route: Option<String>,
}

impl ManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            session: settings.session.clone(),
            replication: settings.replication.clone(),
            passivation: settings.passivation.clone(),
            ownership_timeout_ms: settings.cluster.ownership_timeout_ms,
            jvm_route: settings.jvm_route(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            replication: ReplicationConfig::default(),
            passivation: PassivationConfig::default(),
            ownership_timeout_ms: 5000,
            jvm_route: None,
        }
    }
}
