//! Redis-backed distributed cache.
//!
//! Key layout under `key_prefix`:
//! - `{prefix}:session:{id}` hash with `version`, `timestamp`, `metadata` (JSON), `owner`
//! - `{prefix}:attrs:{id}` hash of attribute name to JSON value
//! - `{prefix}:index` hash of session id to last owning node
//! - `{prefix}:lock:{id}` ownership lease holding the owner's node id
//! - `{prefix}:last_owner:{id}` node that most recently acquired ownership
//!
//! Change events are published as JSON on the configured event channel and
//! fed back into this node's broadcast channel by `RedisEventRelay`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::RedisConfig;
use crate::session::{
    AttributeDelta, AttributeMap, IncomingSessionData, OutgoingSessionData, SessionMetadata,
};

use super::traits::{DistributedCache, SessionOwnership};
use super::types::{CacheBackend, CacheError, ClusterConfig, ClusterEvent, LockResult};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Poll interval while waiting for another node to release a session
const LOCK_POLL_INTERVAL_MS: u64 = 25;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const RENEW_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// How often a held lease is extended: three renewals per lease period
fn renewal_interval(lease_ms: u64) -> Duration {
    Duration::from_millis((lease_ms / 3).max(10))
}

#[derive(Clone)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn session(&self, real_id: &str) -> String {
        format!("{}:session:{}", self.prefix, real_id)
    }

    fn attributes(&self, real_id: &str) -> String {
        format!("{}:attrs:{}", self.prefix, real_id)
    }

    fn index(&self) -> String {
        format!("{}:index", self.prefix)
    }

    fn lock(&self, real_id: &str) -> String {
        format!("{}:lock:{}", self.prefix, real_id)
    }

    fn last_owner(&self, real_id: &str) -> String {
        format!("{}:last_owner:{}", self.prefix, real_id)
    }
}

pub struct RedisDistributedCache {
    node_id: String,
    config: ClusterConfig,
    keys: KeySpace,
    connection: ConnectionManager,
    events: broadcast::Sender<ClusterEvent>,
    ownership: Arc<RedisOwnership>,
}

impl RedisDistributedCache {
    /// Connect to Redis and prepare the key space for this node
    pub async fn connect(redis: &RedisConfig, config: ClusterConfig) -> Result<Self, CacheError> {
        let client = Client::open(redis.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        let keys = KeySpace {
            prefix: config.key_prefix.clone(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ownership = Arc::new(RedisOwnership {
            node_id: config.node_id.clone(),
            keys: keys.clone(),
            connection: connection.clone(),
            lease_ms: config.lock_lease_ms,
            release_script: Script::new(RELEASE_LOCK_SCRIPT),
            renewals: DashMap::new(),
        });

        tracing::info!(
            node_id = %config.node_id,
            key_prefix = %config.key_prefix,
            "Connected Redis distributed cache"
        );

        Ok(Self {
            node_id: config.node_id.clone(),
            config,
            keys,
            connection,
            events,
            ownership,
        })
    }

    /// Sender the pub/sub relay feeds remote events into
    pub fn event_sender(&self) -> broadcast::Sender<ClusterEvent> {
        self.events.clone()
    }

    pub fn event_channel(&self) -> &str {
        &self.config.event_channel
    }

    /// Round-trip to Redis for health checks
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, event: &ClusterEvent) -> Result<(), CacheError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.connection.clone();
        let _: i64 = conn.publish(&self.config.event_channel, payload).await?;
        Ok(())
    }

    async fn delete_session_keys(&self, real_id: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(self.keys.session(real_id))
            .ignore()
            .del(self.keys.attributes(real_id))
            .ignore()
            .del(self.keys.last_owner(real_id))
            .ignore()
            .hdel(self.keys.index(), real_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn parse_field<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &str,
    real_id: &str,
) -> Result<T, CacheError> {
    fields
        .get(name)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| CacheError::InvalidData(format!("{}: missing or invalid {}", real_id, name)))
}

fn encode_attributes(attributes: &AttributeMap) -> Result<Vec<(String, String)>, CacheError> {
    attributes
        .iter()
        .map(|(name, value)| Ok((name.clone(), serde_json::to_string(value)?)))
        .collect()
}

#[async_trait]
impl DistributedCache for RedisDistributedCache {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn backend_type(&self) -> CacheBackend {
        CacheBackend::Redis
    }

    async fn get_session_data(
        &self,
        real_id: &str,
        include_attributes: bool,
    ) -> Result<Option<IncomingSessionData>, CacheError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.session(real_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let metadata_json = fields
            .get("metadata")
            .ok_or_else(|| CacheError::InvalidData(format!("{}: missing metadata", real_id)))?;
        let metadata: SessionMetadata = serde_json::from_str(metadata_json)?;

        let attributes = if include_attributes {
            let raw: HashMap<String, String> = conn.hgetall(self.keys.attributes(real_id)).await?;
            let mut attributes = AttributeMap::with_capacity(raw.len());
            for (name, value) in raw {
                attributes.insert(name, serde_json::from_str(&value)?);
            }
            Some(attributes)
        } else {
            None
        };

        Ok(Some(IncomingSessionData {
            version: parse_field(&fields, "version", real_id)?,
            timestamp: parse_field(&fields, "timestamp", real_id)?,
            metadata,
            attributes,
        }))
    }

    async fn store_session_data(&self, data: &OutgoingSessionData) -> Result<(), CacheError> {
        let session_key = self.keys.session(&data.real_id);
        let attributes_key = self.keys.attributes(&data.real_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(&session_key, "version", data.version).ignore();
        pipe.hset(&session_key, "owner", &self.node_id).ignore();
        if let Some(timestamp) = data.timestamp {
            pipe.hset(&session_key, "timestamp", timestamp).ignore();
        }
        if let Some(metadata) = &data.metadata {
            pipe.hset(&session_key, "metadata", serde_json::to_string(metadata)?)
                .ignore();
            if data.timestamp.is_none() {
                pipe.hset_nx(&session_key, "timestamp", metadata.creation_time)
                    .ignore();
            }
        }
        match &data.attributes {
            Some(AttributeDelta::Full { attributes }) => {
                pipe.del(&attributes_key).ignore();
                let items = encode_attributes(attributes)?;
                if !items.is_empty() {
                    pipe.hset_multiple(&attributes_key, items.as_slice()).ignore();
                }
            }
            Some(AttributeDelta::Partial { modified, removed }) => {
                if !removed.is_empty() {
                    pipe.hdel(&attributes_key, removed).ignore();
                }
                let items = encode_attributes(modified)?;
                if !items.is_empty() {
                    pipe.hset_multiple(&attributes_key, items.as_slice()).ignore();
                }
            }
            None => {}
        }
        pipe.hset(self.keys.index(), &data.real_id, &self.node_id).ignore();
        pipe.hget(&session_key, "timestamp");
        pipe.hget(&session_key, "metadata");

        let mut conn = self.connection.clone();
        let (timestamp, metadata): (Option<i64>, Option<String>) = pipe.query_async(&mut conn).await?;

        let Some(metadata) = metadata else {
            // Written without ever having been created; do not leave a half record behind
            self.delete_session_keys(&data.real_id).await?;
            return Err(CacheError::NotFound(data.real_id.clone()));
        };

        let event = ClusterEvent::SessionChanged {
            real_id: data.real_id.clone(),
            origin: self.node_id.clone(),
            version: data.version,
            timestamp: timestamp.unwrap_or_default(),
            metadata: Some(serde_json::from_str(&metadata)?),
        };
        if let Err(e) = self.publish(&event).await {
            tracing::warn!(
                session_id = %data.real_id,
                error = %e,
                "Failed to publish session change"
            );
        }
        Ok(())
    }

    async fn remove_session(&self, real_id: &str) -> Result<(), CacheError> {
        self.delete_session_keys(real_id).await?;
        self.publish(&ClusterEvent::SessionRemoved {
            real_id: real_id.to_string(),
            origin: self.node_id.clone(),
        })
        .await
    }

    async fn remove_session_local(&self, real_id: &str) -> Result<(), CacheError> {
        // Redis holds the only copy; purging it is silent
        self.delete_session_keys(real_id).await
    }

    async fn evict_session(&self, real_id: &str) -> Result<(), CacheError> {
        tracing::trace!(node_id = %self.node_id, session_id = %real_id, "Evicted session");
        Ok(())
    }

    async fn session_ids(&self) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.connection.clone();
        Ok(conn.hgetall(self.keys.index()).await?)
    }

    async fn is_local(&self, real_id: &str) -> bool {
        let mut conn = self.connection.clone();
        conn.exists(self.keys.session(real_id)).await.unwrap_or(false)
    }

    async fn locate(&self, real_id: &str) -> Option<String> {
        let mut conn = self.connection.clone();
        let holder: Option<String> = conn.get(self.keys.lock(real_id)).await.unwrap_or(None);
        if holder.is_some() {
            return holder;
        }
        let owner: Option<String> = conn.hget(self.keys.index(), real_id).await.unwrap_or(None);
        owner
    }

    fn ownership(&self) -> Option<Arc<dyn SessionOwnership>> {
        Some(self.ownership.clone())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ClusterEvent>> {
        Some(self.events.subscribe())
    }
}

/// Lease-based session ownership stored in Redis.
///
/// While this node holds a session, a background task keeps extending the
/// lease so requests running longer than `lock_lease_ms` stay exclusive. The
/// lease only lapses if this node stops renewing it, e.g. after a crash.
pub struct RedisOwnership {
    node_id: String,
    keys: KeySpace,
    connection: ConnectionManager,
    lease_ms: u64,
    release_script: Script,
    renewals: DashMap<String, JoinHandle<()>>,
}

impl RedisOwnership {
    fn start_renewal(&self, real_id: &str) {
        let lock_key = self.keys.lock(real_id);
        let node_id = self.node_id.clone();
        let lease_ms = self.lease_ms;
        let mut conn = self.connection.clone();
        let session_id = real_id.to_string();

        let handle = tokio::spawn(async move {
            let script = Script::new(RENEW_LOCK_SCRIPT);
            let mut timer = tokio::time::interval(renewal_interval(lease_ms));
            // Skip immediate first tick
            timer.tick().await;
            loop {
                timer.tick().await;
                let renewed: Result<i64, redis::RedisError> = script
                    .key(&lock_key)
                    .arg(&node_id)
                    .arg(lease_ms)
                    .invoke_async(&mut conn)
                    .await;
                match renewed {
                    Ok(1) => {
                        tracing::trace!(session_id = %session_id, "Renewed ownership lease");
                    }
                    Ok(_) => {
                        tracing::warn!(session_id = %session_id, "Ownership lease lost before release");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Failed to renew ownership lease");
                    }
                }
            }
        });

        if let Some(previous) = self.renewals.insert(real_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn stop_renewal(&self, real_id: &str) {
        if let Some((_, handle)) = self.renewals.remove(real_id) {
            handle.abort();
        }
    }
}

#[async_trait]
impl SessionOwnership for RedisOwnership {
    async fn acquire_session_ownership(
        &self,
        real_id: &str,
        new_lock: bool,
    ) -> Result<LockResult, CacheError> {
        let lock_key = self.keys.lock(real_id);
        let mut conn = self.connection.clone();

        loop {
            let holder: Option<String> = conn.get(&lock_key).await?;
            match holder.as_deref() {
                Some(holder) if holder == self.node_id => {
                    let _: i64 = redis::cmd("PEXPIRE")
                        .arg(&lock_key)
                        .arg(self.lease_ms)
                        .query_async(&mut conn)
                        .await?;
                    return Ok(LockResult::AlreadyHeld);
                }
                Some(_) => {}
                None => {
                    let acquired: Option<String> = redis::cmd("SET")
                        .arg(&lock_key)
                        .arg(&self.node_id)
                        .arg("NX")
                        .arg("PX")
                        .arg(self.lease_ms)
                        .query_async(&mut conn)
                        .await?;
                    if acquired.is_some() {
                        self.start_renewal(real_id);
                        let previous: Option<String> = conn
                            .getset(self.keys.last_owner(real_id), &self.node_id)
                            .await?;
                        return Ok(match previous {
                            Some(previous) if previous != self.node_id && !new_lock => {
                                LockResult::AcquiredFromCluster
                            }
                            _ => LockResult::NewLock,
                        });
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(LOCK_POLL_INTERVAL_MS)).await;
        }
    }

    async fn relinquish_session_ownership(&self, real_id: &str, remove: bool) -> Result<(), CacheError> {
        self.stop_renewal(real_id);
        let mut conn = self.connection.clone();
        let _: i64 = self
            .release_script
            .key(self.keys.lock(real_id))
            .arg(&self.node_id)
            .invoke_async(&mut conn)
            .await?;
        if remove {
            let _: () = conn.del(self.keys.last_owner(real_id)).await?;
        }
        Ok(())
    }
}
