use serde::{Deserialize, Serialize};

/// Agent lifecycle state machine.
///
/// `Created → Initializing → Active → (Busy ↔ Active) → ShuttingDown →
/// Terminated`, with `Paused` reachable from `Active`/`Busy`. Only `Active`
/// accepts new tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    Created,
    Initializing,
    Active,
    Busy,
    Paused,
    ShuttingDown,
    Terminated,
}

impl AgentLifecycle {
    pub fn can_transition(self, to: AgentLifecycle) -> bool {
        use AgentLifecycle::*;
        matches!(
            (self, to),
            (Created, Initializing)
                | (Initializing, Active)
                | (Active, Busy)
                | (Busy, Active)
                | (Active, Paused)
                | (Busy, Paused)
                | (Paused, Active)
                | (Active, ShuttingDown)
                | (Busy, ShuttingDown)
                | (Paused, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    pub fn accepts_tasks(self) -> bool {
        self == Self::Active
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }
}

impl std::fmt::Display for AgentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Initializing => "INITIALIZING",
            Self::Active => "ACTIVE",
            Self::Busy => "BUSY",
            Self::Paused => "PAUSED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Terminated => "TERMINATED",
        };
        write!(f, "{}", s)
    }
}
