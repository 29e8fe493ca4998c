use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::cache::ClusterConfig;
use crate::session::NotificationPolicyKind;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub passivation: PassivationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// First delay before the event relay resubscribes
    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed subscriptions before the relay gives up, 0 for never
    #[serde(default)]
    pub reconnect_max_attempts: u32,
}

/// Session lifecycle limits
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Maximum active sessions (hot + unloaded - passivated), -1 for unlimited
    #[serde(default = "default_max_active_allowed")]
    pub max_active_allowed: i64,
    /// Default idle timeout for new sessions; <= 0 never times out
    #[serde(default = "default_max_inactive_seconds")]
    pub max_inactive_seconds: i64,
    /// Append the node route to session ids handed to clients
    #[serde(default)]
    pub use_jvm_route: bool,
    /// Route suffix for this node (defaults to the cluster node id)
    #[serde(default)]
    pub jvm_route: Option<String>,
    /// Maintenance pass interval in seconds
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_seconds: u64,
    /// Failed cleanups of a presumed-expired session before it is force-forgotten
    #[serde(default = "default_cleanup_failure_threshold")]
    pub cleanup_failure_threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationGranularity {
    /// Whole attribute map replicated whenever anything changes
    Session,
    /// Only modified and removed attributes replicated
    Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationTrigger {
    Set,
    SetAndGet,
    SetAndNonPrimitiveGet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    Instant,
    Interval,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_granularity")]
    pub granularity: ReplicationGranularity,
    #[serde(default = "default_trigger")]
    pub trigger: ReplicationTrigger,
    #[serde(default = "default_snapshot_mode")]
    pub snapshot_mode: SnapshotMode,
    /// Flush interval for the interval snapshot mode
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ms: u64,
    /// -1 never forces timestamp replication, 0 always does, > 0 caps the unreplicated window
    #[serde(default = "default_max_unreplicated_interval")]
    pub max_unreplicated_interval_ms: i64,
    /// How long after loading from the cluster the full attribute map keeps being shipped
    #[serde(default = "default_full_replication_window")]
    pub full_replication_window_ms: i64,
    #[serde(default = "default_notification_policy")]
    pub notification_policy: NotificationPolicyKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PassivationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Minimum idle time before a session may be passivated to respect max_active_allowed
    #[serde(default = "default_passivation_idle")]
    pub min_idle_seconds: i64,
    /// Idle time after which a session is always passivated, -1 disables
    #[serde(default = "default_passivation_idle")]
    pub max_idle_seconds: i64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_reconnect_initial_delay() -> u64 {
    100
}

fn default_reconnect_max_delay() -> u64 {
    30_000
}

fn default_max_active_allowed() -> i64 {
    -1
}

fn default_max_inactive_seconds() -> i64 {
    1800 // 30 minutes
}

fn default_maintenance_interval() -> u64 {
    10
}

fn default_cleanup_failure_threshold() -> u32 {
    3
}

fn default_granularity() -> ReplicationGranularity {
    ReplicationGranularity::Session
}

fn default_trigger() -> ReplicationTrigger {
    ReplicationTrigger::SetAndNonPrimitiveGet
}

fn default_snapshot_mode() -> SnapshotMode {
    SnapshotMode::Instant
}

fn default_snapshot_interval() -> u64 {
    1000
}

fn default_max_unreplicated_interval() -> i64 {
    60_000 // 1 minute
}

fn default_full_replication_window() -> i64 {
    5000
}

fn default_notification_policy() -> NotificationPolicyKind {
    NotificationPolicyKind::IgnoreUndeploy
}

fn default_passivation_idle() -> i64 {
    -1
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("session.max_active_allowed", -1)?
            .set_default("session.max_inactive_seconds", 1800)?
            .set_default("replication.snapshot_mode", "instant")?
            .set_default("passivation.enabled", false)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SERVER__PORT, CLUSTER__ENABLED, SESSION__MAX_ACTIVE_ALLOWED, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Route suffix appended to session ids, if routing is enabled
    pub fn jvm_route(&self) -> Option<String> {
        if !self.session.use_jvm_route {
            return None;
        }
        Some(
            self.session
                .jvm_route
                .clone()
                .unwrap_or_else(|| self.cluster.node_id.clone()),
        )
    }
}

impl SessionConfig {
    /// Capacity limit, `None` when unlimited
    pub fn max_active(&self) -> Option<usize> {
        if self.max_active_allowed < 0 {
            None
        } else {
            Some(self.max_active_allowed as usize)
        }
    }
}

impl ReplicationConfig {
    /// Grace period added to an unloaded session's idle timeout before it is presumed expired
    pub fn unloaded_grace_ms(&self) -> i64 {
        if self.max_unreplicated_interval_ms < 0 {
            60_000
        } else {
            self.max_unreplicated_interval_ms
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            reconnect_max_attempts: 0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active_allowed: default_max_active_allowed(),
            max_inactive_seconds: default_max_inactive_seconds(),
            use_jvm_route: false,
            jvm_route: None,
            maintenance_interval_seconds: default_maintenance_interval(),
            cleanup_failure_threshold: default_cleanup_failure_threshold(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            granularity: default_granularity(),
            trigger: default_trigger(),
            snapshot_mode: default_snapshot_mode(),
            snapshot_interval_ms: default_snapshot_interval(),
            max_unreplicated_interval_ms: default_max_unreplicated_interval(),
            full_replication_window_ms: default_full_replication_window(),
            notification_policy: default_notification_policy(),
        }
    }
}

impl Default for PassivationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_idle_seconds: default_passivation_idle(),
            max_idle_seconds: default_passivation_idle(),
        }
    }
}
