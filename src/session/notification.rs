//! Session lifecycle events and the policy deciding which listeners hear about them.

use serde::{Deserialize, Serialize};

/// Why a lifecycle event is happening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCause {
    Create,
    Modify,
    Invalidate,
    Timeout,
    Failover,
    Replication,
    Passivation,
    Activation,
    Undeploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Created,
    Destroyed,
    AttributeAdded,
    AttributeReplaced,
    AttributeRemoved,
    WillPassivate,
    DidActivate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session_id: String,
    pub cause: NotificationCause,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind, session_id: &str, cause: NotificationCause) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            cause,
            attribute: None,
        }
    }

    pub fn for_attribute(
        kind: SessionEventKind,
        session_id: &str,
        cause: NotificationCause,
        attribute: &str,
    ) -> Self {
        Self {
            attribute: Some(attribute.to_string()),
            ..Self::new(kind, session_id, cause)
        }
    }
}

/// Application callback for session lifecycle events
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPolicyKind {
    /// Lifecycle events only for locally originated calls, never for failover
    Legacy,
    /// Legacy, and additionally silent on undeploy
    IgnoreUndeploy,
}

/// Single decision point for listener invocation
#[derive(Debug, Clone, Copy)]
pub struct NotificationPolicy {
    kind: NotificationPolicyKind,
}

impl NotificationPolicy {
    pub fn new(kind: NotificationPolicyKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> NotificationPolicyKind {
        self.kind
    }

    /// Created / destroyed events
    pub fn is_lifecycle_allowed(&self, cause: NotificationCause, local: bool) -> bool {
        if !local || cause == NotificationCause::Failover {
            return false;
        }
        match self.kind {
            NotificationPolicyKind::Legacy => true,
            NotificationPolicyKind::IgnoreUndeploy => cause != NotificationCause::Undeploy,
        }
    }

    /// Attribute added / replaced / removed events
    pub fn is_attribute_allowed(&self, cause: NotificationCause, local: bool) -> bool {
        self.is_lifecycle_allowed(cause, local)
    }

    /// Will-passivate / did-activate events
    pub fn is_activation_allowed(&self, _cause: NotificationCause) -> bool {
        true
    }

    pub fn allows(&self, event: &SessionEvent, local: bool) -> bool {
        match event.kind {
            SessionEventKind::Created | SessionEventKind::Destroyed => {
                self.is_lifecycle_allowed(event.cause, local)
            }
            SessionEventKind::AttributeAdded
            | SessionEventKind::AttributeReplaced
            | SessionEventKind::AttributeRemoved => self.is_attribute_allowed(event.cause, local),
            SessionEventKind::WillPassivate | SessionEventKind::DidActivate => {
                self.is_activation_allowed(event.cause)
            }
        }
    }
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self::new(NotificationPolicyKind::IgnoreUndeploy)
    }
}
