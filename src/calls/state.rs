//! Call session state machine.

use crate::types::call::EndReason;
use crate::types::peer::PeerIdentity;
use serde::Serialize;

/// Lifecycle state of a call session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub enum CallSessionState {
    /// Created, `start()` not yet completed.
    #[default]
    Idle,
    /// Media ready, relay open, self published. Waiting for the remote peer.
    AwaitingPeer,
    /// A local offer is out.
    Offering,
    /// A remote offer was accepted and answered.
    Answering,
    /// ICE reported connectivity.
    Connected,
    Ended { reason: EndReason },
}

impl CallSessionState {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Offering | Self::Answering)
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        match self {
            Self::Ended { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Which side of the offer/answer exchange this session ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallRole {
    /// No offer/answer pair has completed yet. A session that is offering
    /// stays unresolved until the remote answer is applied.
    #[default]
    Unresolved,
    Offerer,
    Answerer,
}

#[derive(Debug, Clone)]
pub enum CallTransition {
    Joined,
    OfferSent,
    /// A remote offer was applied; also the losing side of glare.
    OfferAccepted,
    AnswerApplied,
    IceConnected,
    Terminated { reason: EndReason },
}

/// Outcome of two offers crossing on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareOutcome {
    /// Ignore the remote offer and keep waiting for an answer.
    KeepOffering,
    /// Drop the local offer and answer the remote one.
    Yield,
}

/// The side with the lexically greater identity keeps its offer. Both sides
/// evaluate the same comparison, so exactly one of them yields.
pub fn resolve_glare(local: &PeerIdentity, remote: &PeerIdentity) -> GlareOutcome {
    if local > remote {
        GlareOutcome::KeepOffering
    } else {
        GlareOutcome::Yield
    }
}

/// State plus role, mutated only through [`apply_transition`](Self::apply_transition).
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    state: CallSessionState,
    role: CallRole,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &CallSessionState {
        &self.state
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let (state, role) = match (&self.state, self.role, transition) {
            (CallSessionState::Idle, _, CallTransition::Joined) => {
                (CallSessionState::AwaitingPeer, self.role)
            }
            (CallSessionState::AwaitingPeer, CallRole::Unresolved, CallTransition::OfferSent) => {
                (CallSessionState::Offering, CallRole::Unresolved)
            }
            (
                CallSessionState::AwaitingPeer | CallSessionState::Offering,
                CallRole::Unresolved,
                CallTransition::OfferAccepted,
            ) => (CallSessionState::Answering, CallRole::Answerer),
            (CallSessionState::Offering, CallRole::Unresolved, CallTransition::AnswerApplied) => {
                (CallSessionState::Offering, CallRole::Offerer)
            }
            (
                CallSessionState::Offering | CallSessionState::Answering,
                role,
                CallTransition::IceConnected,
            ) => (CallSessionState::Connected, role),
            (current, role, CallTransition::Terminated { reason }) if !current.is_ended() => {
                (CallSessionState::Ended { reason }, role)
            }
            (current, role, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?} ({role:?})"),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        self.state = state;
        self.role = role;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn awaiting() -> SessionMachine {
        let mut machine = SessionMachine::new();
        machine.apply_transition(CallTransition::Joined).unwrap();
        machine
    }

    /// Idle → AwaitingPeer → Offering → (answer) → Connected → Ended
    #[test]
    fn test_offerer_flow() {
        let mut machine = awaiting();
        machine.apply_transition(CallTransition::OfferSent).unwrap();
        assert_eq!(machine.state(), &CallSessionState::Offering);
        assert_eq!(machine.role(), CallRole::Unresolved);

        machine.apply_transition(CallTransition::AnswerApplied).unwrap();
        assert_eq!(machine.role(), CallRole::Offerer);
        assert_eq!(machine.state(), &CallSessionState::Offering);

        machine.apply_transition(CallTransition::IceConnected).unwrap();
        assert_eq!(machine.state(), &CallSessionState::Connected);

        machine
            .apply_transition(CallTransition::Terminated {
                reason: EndReason::LocalHangup,
            })
            .unwrap();
        assert_eq!(
            machine.state().end_reason(),
            Some(&EndReason::LocalHangup)
        );
        assert_eq!(machine.role(), CallRole::Offerer);
    }

    #[test]
    fn test_answerer_flow() {
        let mut machine = awaiting();
        machine.apply_transition(CallTransition::OfferAccepted).unwrap();
        assert_eq!(machine.state(), &CallSessionState::Answering);
        assert_eq!(machine.role(), CallRole::Answerer);

        machine.apply_transition(CallTransition::IceConnected).unwrap();
        assert_eq!(machine.state(), &CallSessionState::Connected);
    }

    #[test]
    fn test_glare_loser_falls_back_to_answering() {
        let mut machine = awaiting();
        machine.apply_transition(CallTransition::OfferSent).unwrap();
        machine.apply_transition(CallTransition::OfferAccepted).unwrap();
        assert_eq!(machine.state(), &CallSessionState::Answering);
        assert_eq!(machine.role(), CallRole::Answerer);
    }

    #[test]
    fn test_role_never_changes_once_assigned() {
        let mut machine = awaiting();
        machine.apply_transition(CallTransition::OfferSent).unwrap();
        machine.apply_transition(CallTransition::AnswerApplied).unwrap();

        assert!(machine.apply_transition(CallTransition::OfferAccepted).is_err());
        assert!(machine.apply_transition(CallTransition::AnswerApplied).is_err());
        assert_eq!(machine.role(), CallRole::Offerer);
    }

    #[test]
    fn test_no_connected_without_negotiation() {
        let mut machine = SessionMachine::new();
        assert!(machine.apply_transition(CallTransition::IceConnected).is_err());

        machine.apply_transition(CallTransition::Joined).unwrap();
        assert!(machine.apply_transition(CallTransition::IceConnected).is_err());
    }

    #[test]
    fn test_ended_is_terminal() {
        let mut machine = awaiting();
        machine
            .apply_transition(CallTransition::Terminated {
                reason: EndReason::LocalStop,
            })
            .unwrap();

        assert!(machine.apply_transition(CallTransition::OfferSent).is_err());
        assert!(
            machine
                .apply_transition(CallTransition::Terminated {
                    reason: EndReason::RemoteLeft,
                })
                .is_err()
        );
        assert_eq!(machine.state().end_reason(), Some(&EndReason::LocalStop));
    }

    #[test]
    fn test_glare_tie_break_is_antisymmetric() {
        let a = PeerIdentity::from("3f1c");
        let b = PeerIdentity::from("a902");
        assert_eq!(resolve_glare(&b, &a), GlareOutcome::KeepOffering);
        assert_eq!(resolve_glare(&a, &b), GlareOutcome::Yield);
    }
}
