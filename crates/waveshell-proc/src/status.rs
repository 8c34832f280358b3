use serde::{Deserialize, Serialize};

/// Connection status of a [`crate::proc::WaveshellProc`] (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl Status {
    /// Whether `self -> next` is one of the legal transitions in spec.md §4.4's diagram.
    /// `setErr` is legal from any state, so `Error` is always reachable.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (_, Error) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Error) => true,
            (Connecting, Disconnected) => true,
            (Connected, Disconnected) => true,
            (Error, Connecting) => true,
            (same, next) if same == next => true,
            _ => false,
        }
    }
}

/// Status of the install subroutine, tracked alongside [`Status`] but never entered while
/// `Status::Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Disconnected,
    Connecting,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_match_the_diagram() {
        assert!(Status::Disconnected.can_transition_to(Status::Connecting));
        assert!(Status::Connecting.can_transition_to(Status::Connected));
        assert!(Status::Connecting.can_transition_to(Status::Error));
        assert!(Status::Connected.can_transition_to(Status::Disconnected));
        assert!(Status::Error.can_transition_to(Status::Connecting));
        assert!(Status::Connected.can_transition_to(Status::Error));
    }

    #[test]
    fn connected_cannot_jump_straight_to_connecting() {
        assert!(!Status::Connected.can_transition_to(Status::Connecting));
    }

    #[test]
    fn disconnected_cannot_jump_to_connected() {
        assert!(!Status::Disconnected.can_transition_to(Status::Connected));
    }
}
