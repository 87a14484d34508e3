//! Terminal session state machine
//!
//! ```text
//! ┌─────────┐  attach   ┌──────┐
//! │ Opening │ ────────► │ Open │
//! └────┬────┘           └──┬───┘
//!      │ open failed       │ close() / stream ended / stream error
//!      │                   ▼
//!      │              ┌─────────┐  listeners done  ┌────────┐
//!      └────────────► │ Closing │ ───────────────► │ Closed │
//!                     └─────────┘                  └────────┘
//! ```
//!
//! Only the first close trigger moves the machine; later ones are rejected
//! and the session treats them as no-ops.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Backend open in progress
    #[default]
    Opening,
    /// Stream attached, I/O flowing
    Open,
    /// Stream released, close listeners running
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    error_message: Option<String>,
    state_changed_at: Instant,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Opening,
            error_message: None,
            state_changed_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Why the session closed, if it was not a normal close
    pub fn error(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_changed_at.elapsed()
    }

    pub fn open_success(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Opening => {
                self.transition_to(SessionState::Open);
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: SessionState::Open,
            }),
        }
    }

    /// First close trigger wins; `error` is kept for abnormal closes
    pub fn begin_close(&mut self, error: Option<String>) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Opening | SessionState::Open => {
                self.transition_to(SessionState::Closing);
                self.error_message = error;
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: SessionState::Closing,
            }),
        }
    }

    pub fn close_complete(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Closing => {
                self.transition_to(SessionState::Closed);
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: SessionState::Closed,
            }),
        }
    }

    /// Closing or Closed
    pub fn is_closing(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    fn transition_to(&mut self, new_state: SessionState) {
        tracing::debug!("Session state transition: {} -> {}", self.state, new_state);
        self.state = new_state;
        self.state_changed_at = Instant::now();
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.state(), SessionState::Opening);

        sm.open_success().unwrap();
        assert_eq!(sm.state(), SessionState::Open);

        sm.begin_close(None).unwrap();
        assert_eq!(sm.state(), SessionState::Closing);
        assert!(sm.is_closing());

        sm.close_complete().unwrap();
        assert_eq!(sm.state(), SessionState::Closed);
        assert_eq!(sm.error(), None);
    }

    #[test]
    fn test_open_failure_closes() {
        let mut sm = SessionStateMachine::new();
        sm.begin_close(Some("Connection refused".to_string())).unwrap();
        assert_eq!(sm.error(), Some("Connection refused"));
        assert!(sm.open_success().is_err());
    }

    #[test]
    fn test_second_close_rejected() {
        let mut sm = SessionStateMachine::new();
        sm.open_success().unwrap();
        sm.begin_close(None).unwrap();
        assert!(sm.begin_close(Some("late error".to_string())).is_err());
        // The first trigger's reason is kept
        assert_eq!(sm.error(), None);

        sm.close_complete().unwrap();
        assert!(sm.begin_close(None).is_err());
        assert!(sm.close_complete().is_err());
    }
}
