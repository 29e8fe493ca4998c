//! Per-request session handling.
//!
//! A `RequestContext` holds one request-gate permit for its lifetime. Sessions
//! found or created through it are accessed once and stored when the request
//! finishes; ownership is released after the store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::manager::{RequestPermit, SessionManager};
use crate::session::{ClusteredSession, SessionError};

pub struct RequestContext {
    manager: Arc<SessionManager>,
    permit: Option<RequestPermit>,
    /// Ids invalidated during this request; never reloaded from the cluster
    invalidated: HashSet<String>,
    bound: HashMap<String, Arc<ClusteredSession>>,
    finished: bool,
}

impl RequestContext {
    pub(crate) fn new(manager: Arc<SessionManager>, permit: RequestPermit) -> Self {
        Self {
            manager,
            permit: Some(permit),
            invalidated: HashSet::new(),
            bound: HashMap::new(),
            finished: false,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn bound_sessions(&self) -> usize {
        self.bound.len()
    }

    /// Find a session and start accessing it for this request
    pub async fn find(&mut self, id: &str) -> Result<Option<Arc<ClusteredSession>>, SessionError> {
        let real_id = self.manager.real_id(id);
        if let Some(session) = self.bound.get(&real_id) {
            return Ok(Some(session.clone()));
        }

        let skip_load = self.invalidated.contains(&real_id);
        let Some(session) = self.manager.find_session(id, skip_load).await? else {
            return Ok(None);
        };
        session.access().await?;
        self.bound.insert(real_id, session.clone());
        Ok(Some(session))
    }

    /// Create a session bound to this request
    pub async fn create(&mut self, id: Option<&str>) -> Result<Arc<ClusteredSession>, SessionError> {
        let session = self.manager.create(id).await?;
        session.access().await?;
        self.bound
            .insert(session.real_id().to_string(), session.clone());
        Ok(session)
    }

    /// Invalidate a session across the cluster
    pub async fn invalidate(&mut self, session: &Arc<ClusteredSession>) -> Result<(), SessionError> {
        let real_id = session.real_id().to_string();
        self.manager.invalidate(session).await?;
        self.invalidated.insert(real_id.clone());
        if let Some(bound) = self.bound.remove(&real_id) {
            bound.end_access().await;
        }
        Ok(())
    }

    /// Store every bound session and leave the request gate; returns how many were written
    pub async fn finish(mut self) -> usize {
        self.finished = true;
        let bound = std::mem::take(&mut self.bound);
        let stored = finish_sessions(&self.manager, bound).await;
        self.permit.take();
        stored
    }
}

async fn finish_sessions(
    manager: &SessionManager,
    bound: HashMap<String, Arc<ClusteredSession>>,
) -> usize {
    let mut stored = 0;
    for (real_id, session) in bound {
        if session.is_valid().await && manager.store(&session).await {
            stored += 1;
        }
        session.end_access().await;
        trace!(session_id = %real_id, "Request finished with session");
    }
    stored
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.finished || self.bound.is_empty() {
            return;
        }

        let manager = self.manager.clone();
        let bound = std::mem::take(&mut self.bound);
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    finish_sessions(&manager, bound).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(
                    sessions = bound.len(),
                    "Request context dropped outside a runtime, sessions not stored"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryDistributedCache;
    use crate::manager::ManagerConfig;
    use serde_json::json;
    use std::time::Duration;

    async fn manager() -> (Arc<SessionManager>, Arc<MemoryDistributedCache>) {
        let cache = Arc::new(MemoryDistributedCache::standalone("node-a"));
        let manager = Arc::new(SessionManager::new(ManagerConfig::default(), cache.clone()));
        manager.start().await;
        (manager, cache)
    }

    #[tokio::test]
    async fn test_finish_stores_and_releases_ownership() {
        let (manager, cache) = manager().await;
        let mut request = manager.begin_request().await.unwrap();
        let session = request.create(Some("abc")).await.unwrap();
        session.set_attribute("user", json!("alice")).await.unwrap();
        assert_eq!(cache.cluster().lock_holder("abc").as_deref(), Some("node-a"));

        assert_eq!(request.finish().await, 1);
        assert!(cache.cluster().contains("abc"));
        assert!(cache.cluster().lock_holder("abc").is_none());
        assert!(!session.in_use());
    }

    #[tokio::test]
    async fn test_find_binds_once_per_request() {
        let (manager, cache) = manager().await;
        manager.create(Some("abc")).await.unwrap();

        let mut request = manager.begin_request().await.unwrap();
        let first = request.find("abc").await.unwrap().unwrap();
        let second = request.find("abc").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(request.bound_sessions(), 1);
        request.finish().await;
        assert_eq!(cache.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_invalidated_id_is_not_reloaded() {
        let (manager, _) = manager().await;
        let mut request = manager.begin_request().await.unwrap();
        let session = request.create(Some("abc")).await.unwrap();

        request.invalidate(&session).await.unwrap();
        assert!(request.find("abc").await.unwrap().is_none());
        assert_eq!(request.finish().await, 0);
    }

    #[tokio::test]
    async fn test_drop_finishes_in_background() {
        let (manager, cache) = manager().await;
        {
            let mut request = manager.begin_request().await.unwrap();
            request.create(Some("abc")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.cluster().contains("abc"));
        assert_eq!(manager.gate().in_flight(), 0);
    }
}
