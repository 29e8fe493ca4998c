//! Session records and the types they exchange with the distributed cache.

mod data;
mod error;
mod id;
mod notification;
mod record;
mod support;

pub use data::{
    AttributeDelta, AttributeMap, IncomingSessionData, OutgoingSessionData, SessionMetadata,
};
pub use error::SessionError;
pub use id::SessionId;
pub use notification::{
    NotificationCause, NotificationPolicy, NotificationPolicyKind, SessionEvent, SessionEventKind,
    SessionListener,
};
pub use record::{ClusteredSession, SessionInfo};
pub use support::SessionSupport;
