use std::collections::BTreeSet;
use std::sync::Arc;

use mindmap_system::chrono::Utc;
use mindmap_system::{
    ClientMessage, ConnectionId, ConnectionState, ErrorKind, GraphError, GraphRepository,
    GraphStore, Participant, ParticipantId, PersistedChange, PresenceTracker, ProtocolError,
    RepositoryError, RequestId, RequestRef, ServerEnvelope, ServerMessage, SessionId, SessionMeta,
    StoredSession,
};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::connection::{ConnectionEvent, DisconnectReason};
use crate::connection_registry::{ConnectionHandle, ConnectionRegistry};

/// What `GET /api/sessions/{id}` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDescription {
    pub session: SessionMeta,
    pub live: bool,
    pub participants: Vec<Participant>,
    pub node_count: usize,
    pub edge_count: usize,
}

impl SessionDescription {
    pub fn offline(stored: &StoredSession) -> Self {
        Self {
            session: stored.meta.clone(),
            live: false,
            participants: Vec::new(),
            node_count: stored.nodes.len(),
            edge_count: stored.edges.len(),
        }
    }
}

/// Authoritative state of one live session. Not thread safe by itself: the
/// session worker owns it and feeds it one command at a time.
pub struct Session {
    meta: SessionMeta,
    store: GraphStore,
    presence: PresenceTracker,
    registry: ConnectionRegistry,
    repository: Arc<dyn GraphRepository>,
    joins_seen: u64,
}

impl Session {
    /// Loads the session from the repository, creating it when unknown.
    pub fn open(
        session_id: SessionId,
        repository: Arc<dyn GraphRepository>,
        config: &EngineConfig,
    ) -> Result<Self, RepositoryError> {
        let stored = match repository.load(session_id)? {
            Some(stored) => stored,
            None => {
                let meta = SessionMeta::untitled(session_id);
                repository.persist(session_id, &PersistedChange::SessionUpdated(meta.clone()))?;
                log::info!("Created session {}", session_id);
                StoredSession::new(meta)
            }
        };
        let meta = stored.meta.clone();
        let store = GraphStore::from_stored(stored)
            .with_repository(repository.clone())
            .allow_self_loops(config.allow_self_loops);
        Ok(Self {
            meta,
            store,
            presence: PresenceTracker::new(),
            registry: ConnectionRegistry::new(),
            repository,
            joins_seen: 0,
        })
    }

    pub fn id(&self) -> SessionId {
        self.meta.id
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn participants(&self) -> &[Participant] {
        self.presence.list()
    }

    pub fn joins_seen(&self) -> u64 {
        self.joins_seen
    }

    /// No registration left, neither live nor waiting for a reconnect.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn join(
        &mut self,
        connection: ConnectionHandle,
        participant: Participant,
        request_id: Option<RequestId>,
    ) {
        self.joins_seen += 1;
        let connection_id = connection.connection_id();

        match self.registry.find(&participant.participant_id) {
            Some((existing, _)) if existing == connection_id => {
                log::debug!(
                    "Connection {} re-joined session {}, resending snapshot",
                    connection_id,
                    self.id()
                );
            }
            Some((existing, ConnectionState::Reconnecting)) => {
                if let Err(err) = self.registry.resume(existing, connection.clone()) {
                    log::warn!("Could not resume {}: {}", participant.participant_id, err);
                    self.registry
                        .register(connection.clone(), participant.participant_id.clone());
                } else {
                    log::info!(
                        "Participant {} resumed session {} on connection {}",
                        participant.participant_id,
                        self.id(),
                        connection_id
                    );
                }
            }
            Some((existing, _)) => {
                if let Some((_, Some(previous))) = self.registry.unregister(existing) {
                    previous.send(ConnectionEvent::Disconnected {
                        reason: DisconnectReason::Replaced,
                    });
                }
                log::info!(
                    "Participant {} moved from connection {} to {}",
                    participant.participant_id,
                    existing,
                    connection_id
                );
                self.registry
                    .register(connection.clone(), participant.participant_id.clone());
            }
            None => {
                self.registry
                    .register(connection.clone(), participant.participant_id.clone());
            }
        }

        if self.presence.join(participant.clone()) {
            log::info!(
                "Participant {} joined session {}",
                participant.participant_id,
                self.id()
            );
            self.registry.fanout(
                &ServerMessage::ParticipantJoined { participant },
                Some(connection_id),
            );
        }

        // The snapshot goes out in the same step that registers the
        // connection, so every later broadcast is newer than it.
        let snapshot = self.snapshot();
        connection.send_envelope(ServerEnvelope::reply(request_id, snapshot));
        if self.registry.state(connection_id) == Some(ConnectionState::Joined) {
            if let Err(err) = self.registry.activate(connection_id) {
                log::warn!("Connection {} not activated: {}", connection_id, err);
            }
        }
    }

    pub fn snapshot(&self) -> ServerMessage {
        let graph = self.store.snapshot();
        ServerMessage::SessionSnapshot {
            session: self.meta.clone(),
            nodes: graph.nodes,
            edges: graph.edges,
            participants: self.presence.list().to_vec(),
        }
    }

    pub fn handle_request(
        &mut self,
        connection: &ConnectionHandle,
        request_id: Option<RequestId>,
        message: ClientMessage,
    ) {
        let connection_id = connection.connection_id();
        let request = RequestRef {
            request_id,
            kind: message.kind().to_string(),
        };

        let state = self
            .registry
            .state(connection_id)
            .unwrap_or(ConnectionState::Disconnected);
        if !state.is_active() {
            let err = ProtocolError::NotActive {
                state,
                request: message.kind(),
            };
            self.reject(connection, request_id, err, request);
            return;
        }

        let result = match message {
            ClientMessage::NodeCreate(new_node) => self
                .store
                .create_node(new_node)
                .map(|node| ServerMessage::NodeCreated { node }),
            ClientMessage::NodeUpdate { node_id, patch } => self
                .store
                .update_node(node_id, &patch)
                .map(|node| ServerMessage::NodeUpdated { node }),
            ClientMessage::NodeDelete { node_id } => {
                self.store
                    .delete_node(node_id)
                    .map(|deletion| ServerMessage::NodeDeleted {
                        node_id: deletion.node.id,
                        edge_ids: deletion.edge_ids,
                    })
            }
            ClientMessage::EdgeCreate {
                source_id,
                target_id,
            } => self
                .store
                .create_edge(source_id, target_id)
                .map(|edge| ServerMessage::EdgeCreated { edge }),
            ClientMessage::EdgeDelete { edge_id } => self
                .store
                .delete_edge(edge_id)
                .map(|edge| ServerMessage::EdgeDeleted { edge_id: edge.id }),
            ClientMessage::SessionRename { title } => self.rename(&title),
            ClientMessage::CursorMove { x, y } => {
                self.move_cursor(connection_id, x, y, request_id, request);
                return;
            }
            ClientMessage::JoinSession { .. } | ClientMessage::LeaveSession => {
                let err = ProtocolError::Malformed(format!(
                    "{} must be sent before or after a session, not to it",
                    request.kind
                ));
                self.reject(connection, request_id, err, request);
                return;
            }
        };

        match result {
            Ok(event) => {
                self.registry.fanout(&event, Some(connection_id));
                self.registry
                    .send_to(connection_id, ServerEnvelope::reply(request_id, event));
            }
            Err(err) => {
                log::debug!(
                    "Rejected {} from connection {}: {}",
                    request.kind,
                    connection_id,
                    err
                );
                self.registry.send_to(
                    connection_id,
                    ServerEnvelope::reply(request_id, ServerMessage::graph_error(&err, request)),
                );
            }
        }
    }

    /// Immediate leave processing. Returns the handle of the departing
    /// connection if it was still attached.
    pub fn leave(&mut self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        let (participant_id, handle) = self.registry.unregister(connection_id)?;
        self.depart(&participant_id);
        handle
    }

    /// Transport dropped without a leave. Presence is kept until the returned
    /// epoch expires.
    pub fn transport_lost(&mut self, connection_id: ConnectionId) -> Option<(ParticipantId, u64)> {
        let detached = self.registry.detach(connection_id);
        if let Some((participant_id, _)) = &detached {
            log::info!(
                "Participant {} lost its transport in session {}",
                participant_id,
                self.id()
            );
        }
        detached
    }

    /// Detaches every registration whose transport was closed underneath it
    /// (slow consumers, dead channels).
    pub fn reap_closed(&mut self) -> Vec<(ParticipantId, u64)> {
        self.registry
            .closed_connections()
            .into_iter()
            .filter_map(|connection_id| self.transport_lost(connection_id))
            .collect()
    }

    /// Returns `true` when the grace window really ran out and leave
    /// processing happened. Stale timers are no-ops.
    pub fn expire(&mut self, participant_id: &ParticipantId, epoch: u64) -> bool {
        if self.registry.expire(participant_id, epoch).is_some() {
            log::info!(
                "Participant {} did not reconnect to session {} in time",
                participant_id,
                self.id()
            );
            self.depart(participant_id);
            true
        } else {
            false
        }
    }

    pub fn describe(&self) -> SessionDescription {
        SessionDescription {
            session: self.meta.clone(),
            live: true,
            participants: self.presence.list().to_vec(),
            node_count: self.store.node_count(),
            edge_count: self.store.edge_count(),
        }
    }

    /// Presence and registrations describe the same participants.
    pub fn is_consistent(&self) -> bool {
        let registered: BTreeSet<_> = self.registry.participant_ids().into_iter().collect();
        let present: BTreeSet<_> = self
            .presence
            .list()
            .iter()
            .map(|p| p.participant_id.clone())
            .collect();
        registered == present && registered.len() == self.registry.participant_ids().len()
    }

    fn depart(&mut self, participant_id: &ParticipantId) {
        if self.registry.find(participant_id).is_some() {
            return;
        }
        if let Some(participant) = self.presence.leave(participant_id) {
            log::info!(
                "Participant {} left session {}",
                participant.participant_id,
                self.id()
            );
            self.registry
                .fanout(&ServerMessage::ParticipantLeft { participant }, None);
        }
    }

    fn rename(&mut self, title: &str) -> Result<ServerMessage, GraphError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(GraphError::validation("title must not be blank"));
        }
        self.meta.title = title.to_string();
        self.meta.updated_at = Some(Utc::now());
        if let Err(err) = self.repository.persist(
            self.meta.id,
            &PersistedChange::SessionUpdated(self.meta.clone()),
        ) {
            log::error!("Failed to persist title of session {}: {}", self.meta.id, err);
        }
        Ok(ServerMessage::SessionRenamed {
            session: self.meta.clone(),
        })
    }

    fn move_cursor(
        &mut self,
        connection_id: ConnectionId,
        x: f64,
        y: f64,
        request_id: Option<RequestId>,
        request: RequestRef,
    ) {
        if !(x.is_finite() && y.is_finite()) {
            let err = ServerMessage::error(
                ErrorKind::Validation,
                "cursor position must be finite",
                Some(request),
            );
            self.registry
                .send_to(connection_id, ServerEnvelope::reply(request_id, err));
            return;
        }
        let participant = self
            .registry
            .participant(connection_id)
            .and_then(|id| self.presence.get(id))
            .cloned();
        if let Some(participant) = participant {
            self.registry.fanout(
                &ServerMessage::CursorMoved {
                    participant_id: participant.participant_id,
                    display_name: participant.display_name,
                    x,
                    y,
                },
                Some(connection_id),
            );
        }
    }

    fn reject(
        &mut self,
        connection: &ConnectionHandle,
        request_id: Option<RequestId>,
        err: ProtocolError,
        request: RequestRef,
    ) {
        log::warn!(
            "Protocol violation on connection {} in session {}: {}",
            connection.connection_id(),
            self.id(),
            err
        );
        connection.send_envelope(ServerEnvelope::reply(
            request_id,
            ServerMessage::protocol_error(&err, Some(request)),
        ));
        connection.send(ConnectionEvent::Disconnected {
            reason: DisconnectReason::ProtocolViolation,
        });
        // An attached connection is torn down with full leave processing.
        self.leave(connection.connection_id());
    }
}
