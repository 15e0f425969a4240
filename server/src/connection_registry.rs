use std::collections::BTreeMap;

use mindmap_system::{
    ConnectionId, ConnectionState, ParticipantId, ProtocolError, ServerEnvelope, ServerMessage,
    Transition,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionEvent;

pub type ConnectionTx = Sender<ConnectionEvent>;

/// Outbound side of one live connection. Delivery never waits: a full queue
/// marks the connection closed so that it goes through reconnect + resync.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    tx: ConnectionTx,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(connection_id: ConnectionId, tx: ConnectionTx, closed: CancellationToken) -> Self {
        Self {
            connection_id,
            tx,
            closed,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn send(&self, event: ConnectionEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "Outbound queue of connection {} is full, closing it",
                    self.connection_id
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    pub fn send_envelope(&self, envelope: ServerEnvelope) -> bool {
        self.send(ConnectionEvent::Envelope(envelope))
    }
}

#[derive(Debug)]
struct Registration {
    participant_id: ParticipantId,
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
    epoch: u64,
}

/// Connections registered to one session. Each live session owns exactly one
/// registry, so a connection id maps to at most one session.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    registrations: BTreeMap<ConnectionId, Registration>,
    epoch_source: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection in the `Joined` state. Re-registering the same
    /// connection replaces its previous registration.
    pub fn register(&mut self, handle: ConnectionHandle, participant_id: ParticipantId) {
        self.registrations.insert(
            handle.connection_id(),
            Registration {
                participant_id,
                state: ConnectionState::Joined,
                handle: Some(handle),
                epoch: 0,
            },
        );
    }

    pub fn activate(&mut self, connection_id: ConnectionId) -> Result<(), ProtocolError> {
        self.transition(connection_id, Transition::SnapshotDelivered)
    }

    /// Idempotent. Returns the participant and the handle (if still attached).
    pub fn unregister(
        &mut self,
        connection_id: ConnectionId,
    ) -> Option<(ParticipantId, Option<ConnectionHandle>)> {
        self.registrations
            .remove(&connection_id)
            .map(|r| (r.participant_id, r.handle))
    }

    /// Moves an attached connection to `Reconnecting` and returns the epoch
    /// a grace timer must present to expire it.
    pub fn detach(&mut self, connection_id: ConnectionId) -> Option<(ParticipantId, u64)> {
        let registration = self.registrations.get_mut(&connection_id)?;
        if !registration.state.is_attached() {
            return None;
        }
        registration.state = registration.state.apply(Transition::TransportLost).ok()?;
        self.epoch_source += 1;
        let epoch = self.epoch_source;
        registration.handle = None;
        registration.epoch = epoch;
        Some((registration.participant_id.clone(), epoch))
    }

    /// Re-keys a `Reconnecting` registration onto a new transport.
    pub fn resume(
        &mut self,
        previous: ConnectionId,
        handle: ConnectionHandle,
    ) -> Result<(), ProtocolError> {
        let mut registration = self.registrations.remove(&previous).ok_or(
            ProtocolError::UnexpectedTransition {
                state: ConnectionState::Disconnected,
                transition: Transition::Resumed,
            },
        )?;
        match registration.state.apply(Transition::Resumed) {
            Ok(next) => {
                registration.state = next;
                registration.handle = Some(handle.clone());
                self.registrations
                    .insert(handle.connection_id(), registration);
                Ok(())
            }
            Err(err) => {
                self.registrations.insert(previous, registration);
                Err(err)
            }
        }
    }

    /// Removes the registration only if it is still waiting on the timer that
    /// carries `epoch`. A resume in between bumps nothing but the key, so
    /// the state check settles the race.
    pub fn expire(&mut self, participant_id: &ParticipantId, epoch: u64) -> Option<ConnectionId> {
        let connection_id = self
            .registrations
            .iter()
            .find(|(_, r)| {
                &r.participant_id == participant_id
                    && r.state == ConnectionState::Reconnecting
                    && r.epoch == epoch
            })
            .map(|(id, _)| *id)?;
        self.registrations.remove(&connection_id);
        Some(connection_id)
    }

    pub fn find(&self, participant_id: &ParticipantId) -> Option<(ConnectionId, ConnectionState)> {
        self.registrations
            .iter()
            .find(|(_, r)| &r.participant_id == participant_id)
            .map(|(id, r)| (*id, r.state))
    }

    pub fn state(&self, connection_id: ConnectionId) -> Option<ConnectionState> {
        self.registrations.get(&connection_id).map(|r| r.state)
    }

    pub fn participant(&self, connection_id: ConnectionId) -> Option<&ParticipantId> {
        self.registrations
            .get(&connection_id)
            .map(|r| &r.participant_id)
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.registrations
            .values()
            .map(|r| r.participant_id.clone())
            .collect()
    }

    /// Active connections, the fanout targets.
    pub fn connections_for(&self) -> Vec<ConnectionId> {
        self.registrations
            .iter()
            .filter(|(_, r)| r.state.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn send_to(&self, connection_id: ConnectionId, envelope: ServerEnvelope) -> bool {
        self.registrations
            .get(&connection_id)
            .and_then(|r| r.handle.as_ref())
            .map_or(false, |handle| handle.send_envelope(envelope))
    }

    /// Best effort, independent per connection. Returns how many connections
    /// accepted the event.
    pub fn fanout(&self, event: &ServerMessage, exclude: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for (connection_id, registration) in &self.registrations {
            if Some(*connection_id) == exclude || !registration.state.is_active() {
                continue;
            }
            if let Some(handle) = &registration.handle {
                if handle.send_envelope(ServerEnvelope::broadcast(event.clone())) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Attached connections whose transport has been closed underneath them.
    pub fn closed_connections(&self) -> Vec<ConnectionId> {
        self.registrations
            .iter()
            .filter(|(_, r)| r.handle.as_ref().map_or(false, |h| h.is_closed()))
            .map(|(id, _)| *id)
            .collect()
    }

    fn transition(
        &mut self,
        connection_id: ConnectionId,
        transition: Transition,
    ) -> Result<(), ProtocolError> {
        let registration = self.registrations.get_mut(&connection_id).ok_or(
            ProtocolError::UnexpectedTransition {
                state: ConnectionState::Disconnected,
                transition,
            },
        )?;
        registration.state = registration.state.apply(transition)?;
        Ok(())
    }
}
