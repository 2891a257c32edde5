//! Session state machine.

use std::fmt;

/// Lifecycle state of a shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// The callback is running and commands are accepted.
    #[default]
    Open,
    /// The callback has returned; already queued commands still run.
    Draining,
    /// The shell has exited and the channel is released.
    Closed,
}

impl SessionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Open -> Draining
    /// - Open -> Closed (exit directive or abort)
    /// - Draining -> Closed
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Open, Draining) | (Open, Closed) | (Draining, Closed)
        )
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `Ok(())` if the transition is valid, or an error otherwise.
    pub fn transition_to(&mut self, target: SessionState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::UnishellError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Check if new commands may be submitted.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, SessionState::Open)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
