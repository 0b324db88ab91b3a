use serde::{Deserialize, Serialize};
use std::fmt;

/// Observable state of one provider connection. Transitions are reported
/// through the provider's status handler and are not ordered with respect to
/// candle data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    /// Reserved: the v1 providers never emit this; reconnection is the
    /// embedder's concern.
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Engine lifecycle state. Progression is monotonic; in particular
/// `GapFilling` can never be re-entered once `Running` has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Idle,
    Initializing,
    Prefetching,
    GapFilling,
    Running,
    Stopping,
    Stopped,
}

impl EngineStatus {
    pub fn can_transition_to(self, next: EngineStatus) -> bool {
        use EngineStatus::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Prefetching)
                | (Initializing, Running)
                | (Initializing, Stopping)
                | (Prefetching, GapFilling)
                | (Prefetching, Running)
                | (Prefetching, Stopping)
                | (GapFilling, Running)
                | (GapFilling, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_progression() {
        use EngineStatus::*;
        let path = [Idle, Initializing, Prefetching, GapFilling, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_gap_filling_never_reentered_after_running() {
        use EngineStatus::*;
        assert!(!Running.can_transition_to(GapFilling));
        assert!(!Stopping.can_transition_to(GapFilling));
        assert!(!Stopped.can_transition_to(GapFilling));
    }

    #[test]
    fn test_no_backwards_transitions() {
        use EngineStatus::*;
        assert!(!Running.can_transition_to(Prefetching));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Prefetching.can_transition_to(Initializing));
    }
}
