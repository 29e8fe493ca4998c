mod settings;

pub use settings::{
    PassivationConfig, RedisConfig, ReplicationConfig, ReplicationGranularity,
    ReplicationTrigger, ServerConfig, SessionConfig, Settings, SnapshotMode,
};
