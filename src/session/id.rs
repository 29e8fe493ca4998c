//! Session id parsing: a client-visible id is `realId` optionally followed by `.route`.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId {
    real_id: String,
    route: Option<String>,
}

impl SessionId {
    /// Split a client-visible id into its real id and route suffix
    pub fn parse(id: &str, use_route: bool) -> Self {
        if use_route {
            if let Some((real_id, route)) = id.rsplit_once('.') {
                if !real_id.is_empty() {
                    return Self {
                        real_id: real_id.to_string(),
                        route: Some(route.to_string()),
                    };
                }
            }
        }
        Self {
            real_id: id.to_string(),
            route: None,
        }
    }

    /// Generate a fresh real id
    pub fn generate() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Build the client-visible id for a real id on a node
    pub fn with_route(real_id: &str, route: Option<&str>) -> String {
        match route {
            Some(route) if !route.is_empty() => format!("{}.{}", real_id, route),
            _ => real_id.to_string(),
        }
    }

    pub fn real_id(&self) -> &str {
        &self.real_id
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn into_real_id(self) -> String {
        self.real_id
    }
}
