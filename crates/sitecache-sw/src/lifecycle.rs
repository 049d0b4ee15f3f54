//! Worker identity and lifecycle states.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Worker state.
///
/// ```text
/// Parsed → Installing → Installed (waiting) → Activating → Activated
///              │                                              │
///              └──────────────→ Redundant ←───────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Install event in progress.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate event in progress.
    Activating,
    /// Active and serving fetches.
    Activated,
    /// Replaced, unregistered, or failed to install.
    Redundant,
}

impl WorkerState {
    pub fn is_active(&self) -> bool {
        *self == Self::Activated
    }

    /// Installed and not yet activating.
    pub fn is_waiting(&self) -> bool {
        *self == Self::Installed
    }

    pub fn is_redundant(&self) -> bool {
        *self == Self::Redundant
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Parsed | Installing | Installed | Activating | Activated, Redundant)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = ServiceWorkerId::next();
        let b = ServiceWorkerId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("sw-"));
    }

    #[test]
    fn test_transitions() {
        use WorkerState::*;
        assert!(Parsed.can_transition_to(Installing));
        assert!(Installed.can_transition_to(Activating));
        assert!(Activated.can_transition_to(Redundant));
        assert!(!Installing.can_transition_to(Activated));
        assert!(!Redundant.can_transition_to(Installing));
        assert!(!Activated.can_transition_to(Installed));
    }

    #[test]
    fn test_state_queries() {
        assert_eq!(WorkerState::default(), WorkerState::Parsed);
        assert!(WorkerState::Installed.is_waiting());
        assert!(WorkerState::Activated.is_active());
        assert_eq!(WorkerState::Activating.to_string(), "activating");
        assert_eq!(serde_json::to_string(&WorkerState::Redundant).unwrap(), r#""redundant""#);
    }
}
