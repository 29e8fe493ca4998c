//! Wire types exchanged with the distributed cache.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Attribute values are opaque JSON documents
pub type AttributeMap = HashMap<String, serde_json::Value>;

/// Session-level metadata replicated alongside the attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub creation_time: i64,
    pub max_inactive_seconds: i64,
    pub is_new: bool,
    pub is_valid: bool,
}

/// Attribute payload of an outgoing replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeDelta {
    /// Complete attribute map; replaces whatever the cache holds
    Full { attributes: AttributeMap },
    /// Field-level changes since the last replication
    Partial {
        modified: AttributeMap,
        removed: Vec<String>,
    },
}

impl AttributeDelta {
    pub fn is_empty(&self) -> bool {
        match self {
            AttributeDelta::Full { .. } => false,
            AttributeDelta::Partial { modified, removed } => modified.is_empty() && removed.is_empty(),
        }
    }

    /// Apply this delta to a stored attribute map
    pub fn apply_to(&self, target: &mut AttributeMap) {
        match self {
            AttributeDelta::Full { attributes } => {
                *target = attributes.clone();
            }
            AttributeDelta::Partial { modified, removed } => {
                for name in removed {
                    target.remove(name);
                }
                for (name, value) in modified {
                    target.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

/// Minimal set of changes a session ships on replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingSessionData {
    pub real_id: String,
    pub version: u64,
    /// Last access time, present only when it must be replicated
    pub timestamp: Option<i64>,
    /// Present only when metadata changed
    pub metadata: Option<SessionMetadata>,
    /// Present only when attributes changed
    pub attributes: Option<AttributeDelta>,
}

/// Snapshot of a session as held by the distributed cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingSessionData {
    pub version: u64,
    pub timestamp: i64,
    pub metadata: SessionMetadata,
    /// Omitted for metadata-only reads
    pub attributes: Option<AttributeMap>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_delta_apply() {
        let mut stored: AttributeMap = HashMap::new();
        stored.insert("a".to_string(), json!(1));
        stored.insert("b".to_string(), json!(2));

        let mut modified = HashMap::new();
        modified.insert("a".to_string(), json!(10));
        let delta = AttributeDelta::Partial {
            modified,
            removed: vec!["b".to_string()],
        };
        delta.apply_to(&mut stored);

        assert_eq!(stored.get("a"), Some(&json!(10)));
        assert!(!stored.contains_key("b"));
    }

    #[test]
    fn test_full_delta_replaces() {
        let mut stored: AttributeMap = HashMap::new();
        stored.insert("old".to_string(), json!("x"));

        let mut attributes = HashMap::new();
        attributes.insert("new".to_string(), json!("y"));
        AttributeDelta::Full { attributes }.apply_to(&mut stored);

        assert_eq!(stored.len(), 1);
        assert!(stored.contains_key("new"));
    }

    #[test]
    fn test_delta_serialization_is_tagged() {
        let delta = AttributeDelta::Partial {
            modified: HashMap::new(),
            removed: vec!["gone".to_string()],
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["kind"], "partial");
        assert!(!delta.is_empty());
    }
}
