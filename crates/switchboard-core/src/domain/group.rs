//! [`GroupConfig`]: the scheduling policy for a set of models sharing a
//! hardware budget.

use serde::{Deserialize, Serialize};

/// Immutable configuration for one `ProcessGroup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Stable identifier, unique within the owning `ProxyManager`.
    pub id: String,

    /// If true, at most one member may be non-`STOPPED` at a time; an
    /// activation preempts whichever member currently holds the slot.
    #[serde(default)]
    pub swap: bool,

    /// If true, activating any member forces every non-member in other
    /// swap groups to stop first (cross-group exclusivity).
    #[serde(default)]
    pub exclusive: bool,

    /// If true, members are pre-started at boot and never auto-unloaded
    /// by TTL.
    #[serde(default)]
    pub persistent: bool,

    /// Ordered list of model names belonging to this group.
    pub members: Vec<String>,
}

impl GroupConfig {
    #[must_use]
    pub fn has_member(&self, name: &str) -> bool {
        self.members.iter().any(|m| m == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_member_checks_membership() {
        let g = GroupConfig {
            id: "g1".into(),
            swap: true,
            exclusive: false,
            persistent: false,
            members: vec!["m1".into(), "m2".into()],
        };
        assert!(g.has_member("m1"));
        assert!(!g.has_member("m3"));
    }
}
