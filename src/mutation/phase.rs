use std::fmt;

use serde::Serialize;

use crate::error::{Result, SyncError};

/// Lifecycle of one optimistic mutation.
///
/// `Idle -> Optimistic -> Committing -> Settled` on success,
/// `Idle -> Optimistic -> RollingBack -> Settled` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationPhase {
    Idle,
    /// Speculative value applied, write in flight
    Optimistic,
    /// Server accepted the write, reconciling
    Committing,
    /// Server rejected the write, restoring snapshots
    RollingBack,
    Settled,
}

impl MutationPhase {
    pub fn can_transition(self, next: MutationPhase) -> bool {
        use MutationPhase::*;
        matches!(
            (self, next),
            (Idle, Optimistic)
                | (Optimistic, Committing)
                | (Optimistic, RollingBack)
                | (Committing, Settled)
                | (RollingBack, Settled)
        )
    }

    pub fn transition(&mut self, next: MutationPhase) -> Result<()> {
        if !self.can_transition(next) {
            return Err(SyncError::Internal(format!(
                "illegal mutation transition {} -> {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    pub fn is_settled(self) -> bool {
        self == MutationPhase::Settled
    }
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationPhase::Idle => "idle",
            MutationPhase::Optimistic => "optimistic",
            MutationPhase::Committing => "committing",
            MutationPhase::RollingBack => "rolling_back",
            MutationPhase::Settled => "settled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path() {
        let mut phase = MutationPhase::Idle;
        phase.transition(MutationPhase::Optimistic).unwrap();
        phase.transition(MutationPhase::Committing).unwrap();
        phase.transition(MutationPhase::Settled).unwrap();
        assert!(phase.is_settled());
    }

    #[test]
    fn test_failure_path() {
        let mut phase = MutationPhase::Idle;
        phase.transition(MutationPhase::Optimistic).unwrap();
        phase.transition(MutationPhase::RollingBack).unwrap();
        phase.transition(MutationPhase::Settled).unwrap();
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut phase = MutationPhase::Idle;
        assert!(phase.transition(MutationPhase::Committing).is_err());
        assert_eq!(phase, MutationPhase::Idle);

        let mut settled = MutationPhase::Settled;
        assert!(settled.transition(MutationPhase::Optimistic).is_err());
        assert!(!MutationPhase::Committing.can_transition(MutationPhase::RollingBack));
    }
}
