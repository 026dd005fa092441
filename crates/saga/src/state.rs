//! Saga lifecycle states.

use serde::{Deserialize, Serialize};

/// The lifecycle state of a saga instance.
///
/// State transitions:
/// ```text
/// Pending ──► StepRunning(0) ──► StepRunning(1) ──► … ──► Completed
///                  │                   │
///                  └──────┬────────────┘  (retries stay on the same index)
///                         ▼
///              CompensatingRunning(j) ──► CompensatingRunning(j-1) ──► … ──► Compensated
///                         │
///                         └──► CompensationFailed
///
/// any non-terminal state ──► Abandoned (operator request)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "step_index")]
pub enum SagaState {
    /// Created, step 0 not yet attempted.
    #[default]
    Pending,

    /// The forward action of this step is running or about to run.
    StepRunning(usize),

    /// The compensating action of this step is running or about to run.
    CompensatingRunning(usize),

    /// Every step succeeded (terminal).
    Completed,

    /// Every completed step was rolled back (terminal).
    Compensated,

    /// A compensating action could not be applied (terminal, needs an operator).
    CompensationFailed,

    /// Stopped by an operator without further compensation (terminal).
    Abandoned,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed
                | SagaState::Compensated
                | SagaState::CompensationFailed
                | SagaState::Abandoned
        )
    }

    /// Returns true while compensations are being applied.
    pub fn is_compensating(&self) -> bool {
        matches!(self, SagaState::CompensatingRunning(_))
    }

    /// The step index carried by running states.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            SagaState::StepRunning(i) | SagaState::CompensatingRunning(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the state name without its step index.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Pending => "Pending",
            SagaState::StepRunning(_) => "StepRunning",
            SagaState::CompensatingRunning(_) => "CompensatingRunning",
            SagaState::Completed => "Completed",
            SagaState::Compensated => "Compensated",
            SagaState::CompensationFailed => "CompensationFailed",
            SagaState::Abandoned => "Abandoned",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step_index() {
            Some(i) => write!(f, "{}({})", self.as_str(), i),
            None => write!(f, "{}", self.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_pending() {
        assert_eq!(SagaState::default(), SagaState::Pending);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaState::Pending.is_terminal());
        assert!(!SagaState::StepRunning(0).is_terminal());
        assert!(!SagaState::CompensatingRunning(1).is_terminal());
        assert!(SagaState::Completed.is_terminal());
        assert!(SagaState::Compensated.is_terminal());
        assert!(SagaState::CompensationFailed.is_terminal());
        assert!(SagaState::Abandoned.is_terminal());
    }

    #[test]
    fn test_step_index() {
        assert_eq!(SagaState::StepRunning(2).step_index(), Some(2));
        assert_eq!(SagaState::CompensatingRunning(0).step_index(), Some(0));
        assert_eq!(SagaState::Completed.step_index(), None);
        assert!(SagaState::CompensatingRunning(0).is_compensating());
        assert!(!SagaState::StepRunning(0).is_compensating());
    }

    #[test]
    fn test_display() {
        assert_eq!(SagaState::Pending.to_string(), "Pending");
        assert_eq!(SagaState::StepRunning(1).to_string(), "StepRunning(1)");
        assert_eq!(
            SagaState::CompensatingRunning(0).to_string(),
            "CompensatingRunning(0)"
        );
        assert_eq!(
            SagaState::CompensationFailed.to_string(),
            "CompensationFailed"
        );
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_value(SagaState::StepRunning(2)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"state": "StepRunning", "step_index": 2})
        );
        let back: SagaState = serde_json::from_value(json).unwrap();
        assert_eq!(back, SagaState::StepRunning(2));
    }
}
