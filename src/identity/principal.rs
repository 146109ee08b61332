use serde::{Deserialize, Serialize};

/// The authenticated principal a request acts as.
///
/// Built once by the identity provider at sign-in and carried unchanged by every
/// token rotation of the session that owns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { id: id.into(), email: email.into(), display_name: display_name.into() }
    }

    /// Greeting name; falls back to "User" like the dashboard header does.
    pub fn greeting_name(&self) -> &str {
        if self.display_name.trim().is_empty() { "User" } else { self.display_name.as_str() }
    }
}
