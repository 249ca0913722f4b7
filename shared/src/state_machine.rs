//! Session State Machine
//!
//! Defines the valid lifecycle transitions of a paid session.
//!
//! ```text
//! CREATED -> AUTHORIZING -> RELAYING -> VERIFYING -> RUNNING -> DONE
//!     \__________\_____________\____________\___________\------> ERROR
//! ```

use crate::types::SessionState;

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Authorization requested from the backend
    AuthorizationRequested,
    /// Backend returned a signed authorization
    AuthorizationGranted,
    /// Peripheral link confirmed ready for the session
    RelayConfirmed,
    /// Authorization signature checked
    SignatureVerified,
    /// Backend reported the order DONE
    OrderCompleted,
    /// Unrecoverable failure (backend rejection, verification, cancellation)
    Failure { reason: String },
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(SessionState),
    /// Transition was invalid from current state
    Invalid { from: SessionState, event: SessionEvent },
    /// Session moved to ERROR
    Failed { from: SessionState, reason: String },
}

/// The lifecycle state machine for one session
#[derive(Debug)]
pub struct SessionStateMachine {
    current_state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create a new state machine in Created state
    pub fn new() -> Self {
        Self {
            current_state: SessionState::Created,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: SessionEvent) -> TransitionResult {
        if let SessionEvent::Failure { reason } = &event {
            if self.current_state.is_terminal() {
                return TransitionResult::Invalid {
                    from: self.current_state,
                    event,
                };
            }
            let from = self.current_state;
            self.current_state = SessionState::Error;
            return TransitionResult::Failed {
                from,
                reason: reason.clone(),
            };
        }

        match self.get_next_state(&event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    fn get_next_state(&self, event: &SessionEvent) -> Option<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self.current_state, event) {
            (Created, AuthorizationRequested) => Some(Authorizing),
            (Authorizing, AuthorizationGranted) => Some(Relaying),
            (Relaying, RelayConfirmed) => Some(Verifying),
            (Verifying, SignatureVerified) => Some(Running),
            (Running, OrderCompleted) => Some(Done),
            _ => None,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    match (from, to) {
        (a, b) if a == b => true,

        // Terminal states never move again
        (Done | Error, _) => false,

        (_, Error) => true,

        (Created, Authorizing) => true,
        (Authorizing, Relaying) => true,
        (Relaying, Verifying) => true,
        (Verifying, Running) => true,
        (Running, Done) => true,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_fsm() -> SessionStateMachine {
        let mut fsm = SessionStateMachine::new();
        fsm.process_event(SessionEvent::AuthorizationRequested);
        fsm.process_event(SessionEvent::AuthorizationGranted);
        fsm.process_event(SessionEvent::RelayConfirmed);
        fsm.process_event(SessionEvent::SignatureVerified);
        fsm
    }

    #[test]
    fn test_initial_state() {
        let fsm = SessionStateMachine::new();
        assert_eq!(fsm.state(), SessionState::Created);
    }

    #[test]
    fn test_normal_session_flow() {
        let mut fsm = SessionStateMachine::new();

        let result = fsm.process_event(SessionEvent::AuthorizationRequested);
        assert_eq!(result, TransitionResult::Success(SessionState::Authorizing));

        let result = fsm.process_event(SessionEvent::AuthorizationGranted);
        assert_eq!(result, TransitionResult::Success(SessionState::Relaying));

        let result = fsm.process_event(SessionEvent::RelayConfirmed);
        assert_eq!(result, TransitionResult::Success(SessionState::Verifying));

        let result = fsm.process_event(SessionEvent::SignatureVerified);
        assert_eq!(result, TransitionResult::Success(SessionState::Running));

        let result = fsm.process_event(SessionEvent::OrderCompleted);
        assert_eq!(result, TransitionResult::Success(SessionState::Done));
    }

    #[test]
    fn test_failure_from_any_non_terminal_state() {
        let mut fsm = SessionStateMachine::new();
        fsm.process_event(SessionEvent::AuthorizationRequested);

        let result = fsm.process_event(SessionEvent::Failure {
            reason: "authorization rejected".into(),
        });
        assert!(matches!(
            result,
            TransitionResult::Failed { from: SessionState::Authorizing, .. }
        ));
        assert_eq!(fsm.state(), SessionState::Error);

        let mut fsm = running_fsm();
        fsm.process_event(SessionEvent::Failure { reason: "order failed".into() });
        assert_eq!(fsm.state(), SessionState::Error);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut fsm = running_fsm();
        fsm.process_event(SessionEvent::OrderCompleted);

        let result = fsm.process_event(SessionEvent::Failure { reason: "late".into() });
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), SessionState::Done);

        let result = fsm.process_event(SessionEvent::OrderCompleted);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }

    #[test]
    fn test_invalid_transition() {
        let mut fsm = SessionStateMachine::new();

        // Cannot run before the signature is verified
        let result = fsm.process_event(SessionEvent::OrderCompleted);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), SessionState::Created);
    }

    #[test]
    fn test_is_valid_transition() {
        assert!(is_valid_transition(SessionState::Verifying, SessionState::Running));
        assert!(is_valid_transition(SessionState::Relaying, SessionState::Error));
        assert!(!is_valid_transition(SessionState::Done, SessionState::Error));
        assert!(!is_valid_transition(SessionState::Created, SessionState::Running));
    }
}
