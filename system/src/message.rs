use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GraphError, ProtocolError};
use crate::types::*;

/// What a client sends, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinSession {
        session_id: SessionId,
        participant_id: ParticipantId,
        display_name: String,
    },
    LeaveSession,
    NodeCreate(NewNode),
    NodeUpdate {
        node_id: NodeId,
        #[serde(default)]
        patch: NodePatch,
    },
    NodeDelete {
        node_id: NodeId,
    },
    EdgeCreate {
        source_id: NodeId,
        target_id: NodeId,
    },
    EdgeDelete {
        edge_id: EdgeId,
    },
    CursorMove {
        x: f64,
        y: f64,
    },
    SessionRename {
        title: String,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinSession { .. } => "join_session",
            ClientMessage::LeaveSession => "leave_session",
            ClientMessage::NodeCreate(_) => "node_create",
            ClientMessage::NodeUpdate { .. } => "node_update",
            ClientMessage::NodeDelete { .. } => "node_delete",
            ClientMessage::EdgeCreate { .. } => "edge_create",
            ClientMessage::EdgeDelete { .. } => "edge_delete",
            ClientMessage::CursorMove { .. } => "cursor_move",
            ClientMessage::SessionRename { .. } => "session_rename",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Which request an `error` event refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRef {
    pub request_id: Option<RequestId>,
    pub kind: String,
}

/// What the engine sends, tagged by `type`. Every change event carries the
/// full resulting entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionSnapshot {
        session: SessionMeta,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        participants: Vec<Participant>,
    },
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantLeft {
        participant: Participant,
    },
    NodeCreated {
        node: Node,
    },
    NodeUpdated {
        node: Node,
    },
    NodeDeleted {
        node_id: NodeId,
        edge_ids: Vec<EdgeId>,
    },
    EdgeCreated {
        edge: Edge,
    },
    EdgeDeleted {
        edge_id: EdgeId,
    },
    CursorMoved {
        participant_id: ParticipantId,
        display_name: String,
        x: f64,
        y: f64,
    },
    SessionRenamed {
        session: SessionMeta,
    },
    SessionLeft {
        session_id: SessionId,
    },
    Error {
        kind: ErrorKind,
        message: String,
        request: Option<RequestRef>,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>, request: Option<RequestRef>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
            request,
        }
    }

    pub fn graph_error(err: &GraphError, request: RequestRef) -> Self {
        Self::error(err.kind(), err.to_string(), Some(request))
    }

    pub fn protocol_error(err: &ProtocolError, request: Option<RequestRef>) -> Self {
        Self::error(ErrorKind::Protocol, err.to_string(), request)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    pub request_id: Option<RequestId>,
    #[serde(flatten)]
    pub event: ServerMessage,
}

impl ServerEnvelope {
    pub fn broadcast(event: ServerMessage) -> Self {
        Self {
            request_id: None,
            event,
        }
    }

    pub fn reply(request_id: Option<RequestId>, event: ServerMessage) -> Self {
        Self { request_id, event }
    }
}
