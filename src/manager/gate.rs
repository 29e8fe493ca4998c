//! Request gate: every request holds one permit; stopping the manager takes them all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::session::SessionError;

/// Permits available while the gate is open
const TOTAL_PERMITS: u32 = 1 << 24;

pub struct RequestGate {
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    initialized: AtomicBool,
    held: Mutex<Option<OwnedSemaphorePermit>>,
}

/// Proof that a request is inside the gate; released on drop
#[derive(Debug)]
pub struct RequestPermit {
    _permit: OwnedSemaphorePermit,
}

impl RequestGate {
    /// A gate that admits nothing until `open` is called
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(0)),
            closed: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            held: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Admit requests
    pub async fn open(&self) {
        let mut held = self.held.lock().await;
        if let Some(permit) = held.take() {
            drop(permit);
        } else if !self.initialized.swap(true, Ordering::AcqRel) {
            self.semaphore.add_permits(TOTAL_PERMITS as usize);
        }
        self.closed.store(false, Ordering::Release);
    }

    /// Refuse new requests and wait for in-flight ones to finish
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }
        match self.semaphore.clone().acquire_many_owned(TOTAL_PERMITS).await {
            Ok(permit) => {
                *self.held.lock().await = Some(permit);
            }
            Err(_) => {
                tracing::warn!("Request gate semaphore closed while draining");
            }
        }
    }

    /// Enter without waiting; `None` if the gate is closed or draining
    pub fn try_enter(&self) -> Option<RequestPermit> {
        if !self.is_open() {
            return None;
        }
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| RequestPermit { _permit: permit })
    }

    /// Enter, waiting for a permit if necessary
    pub async fn enter(&self) -> Result<RequestPermit, SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotAcceptingRequests);
        }
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map(|permit| RequestPermit { _permit: permit })
            .map_err(|_| SessionError::NotAcceptingRequests)
    }

    /// Requests currently inside the gate
    pub fn in_flight(&self) -> usize {
        if !self.is_open() {
            return 0;
        }
        (TOTAL_PERMITS as usize).saturating_sub(self.semaphore.available_permits())
    }
}

impl Default for RequestGate {
    fn default() -> Self {
        Self::new()
    }
}
