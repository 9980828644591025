//! Common identity types shared across the workspace.

use serde::{Deserialize, Serialize};

/// Unique identifier for a simulation agent (vehicle or infrastructure).
///
/// Opaque string, compared and ordered by value. Ids must be unique while
/// the agent is active; ordering is used for collision-pair normalization
/// and priority tie-breaks, so it must be total and stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Creates an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id carries the given prefix (used for background /
    /// spawned-fleet naming schemes like `BG_…` or `AMBULANCE_…`).
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_ordering_is_lexicographic() {
        let a = AgentId::new("VH_A");
        let b = AgentId::new("VH_B");
        assert!(a < b);
        assert_eq!(a, AgentId::from("VH_A"));
    }

    #[test]
    fn test_agent_id_prefix() {
        let id = AgentId::new("BG_007");
        assert!(id.has_prefix("BG_"));
        assert!(!id.has_prefix("AMBULANCE_"));
    }
}
