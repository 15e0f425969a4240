//! Per-connection lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> Joined -> Active <-> Reconnecting -> Disconnected
//! ```
//!
//! `Error` is reachable from every state on a protocol violation. The
//! transport adapter drives the first half (open, join, snapshot), the session
//! drives `Reconnecting` and its expiry.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joined,
    Active,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    TransportOpened,
    JoinAccepted,
    JoinRejected,
    SnapshotDelivered,
    TransportLost,
    Resumed,
    GraceExpired,
    Left,
    Violation,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl ConnectionState {
    pub fn apply(self, transition: Transition) -> Result<ConnectionState, ProtocolError> {
        use ConnectionState::*;
        use Transition::*;

        let next = match (self, transition) {
            (_, Violation) => Error,
            (Disconnected, TransportOpened) => Connecting,
            (Connecting, JoinAccepted) => Joined,
            (Joined, JoinRejected) => Connecting,
            (Joined, SnapshotDelivered) => Active,
            (Connecting, TransportLost) => Disconnected,
            (Joined, TransportLost) | (Active, TransportLost) => Reconnecting,
            (Reconnecting, Resumed) => Joined,
            (Reconnecting, GraceExpired) => Disconnected,
            (Active, Left) => Connecting,
            (Error, TransportLost) => Disconnected,
            (state, transition) => {
                return Err(ProtocolError::UnexpectedTransition { state, transition })
            }
        };
        Ok(next)
    }

    /// Only active connections may issue mutations or receive broadcasts.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, ConnectionState::Joined | ConnectionState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::Transition::*;
    use super::*;

    fn run(transitions: &[Transition]) -> Result<ConnectionState, ProtocolError> {
        transitions
            .iter()
            .try_fold(Disconnected, |state, t| state.apply(*t))
    }

    #[test]
    fn it_reaches_active_through_the_join_handshake() {
        assert_eq!(
            run(&[TransportOpened, JoinAccepted, SnapshotDelivered]),
            Ok(Active)
        );
    }

    #[test]
    fn it_resumes_a_dropped_transport_through_a_fresh_snapshot() {
        let state = run(&[
            TransportOpened,
            JoinAccepted,
            SnapshotDelivered,
            TransportLost,
            Resumed,
        ])
        .expect("resume is valid");
        assert_eq!(state, Joined);
        assert!(!state.is_active());
        assert_eq!(state.apply(SnapshotDelivered), Ok(Active));
    }

    #[test]
    fn it_disconnects_when_the_grace_window_expires() {
        assert_eq!(
            run(&[
                TransportOpened,
                JoinAccepted,
                SnapshotDelivered,
                TransportLost,
                GraceExpired
            ]),
            Ok(Disconnected)
        );
    }

    #[test]
    fn it_rejects_out_of_order_handshake() {
        let err = Connecting.apply(SnapshotDelivered).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedTransition {
                state: Connecting,
                transition: SnapshotDelivered
            }
        );
        assert!(Active.apply(JoinAccepted).is_err());
    }

    #[test]
    fn it_enters_error_from_any_state() {
        for state in [Disconnected, Connecting, Joined, Active, Reconnecting, Error] {
            assert_eq!(state.apply(Violation), Ok(Error));
        }
        assert_eq!(Error.apply(TransportLost), Ok(Disconnected));
    }

    #[test]
    fn it_returns_to_connecting_after_leaving() {
        assert_eq!(Active.apply(Left), Ok(Connecting));
        assert_eq!(Joined.apply(JoinRejected), Ok(Connecting));
    }
}
