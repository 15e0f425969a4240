use crate::lifecycle::{ConnectionState, Transition};
use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    Edge,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Node => f.write_str("node"),
            EntityKind::Edge => f.write_str("edge"),
        }
    }
}

/// Rejections of a single mutation. Reported to the originator only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: u64 },
}

impl GraphError {
    pub fn validation(message: impl Into<String>) -> Self {
        GraphError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Validation(_) => ErrorKind::Validation,
            GraphError::NotFound { .. } => ErrorKind::NotFound,
        }
    }
}

/// ProtocolError makes connection be closed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{request} is not allowed while connection is {state:?}")]
    NotActive {
        state: ConnectionState,
        request: &'static str,
    },

    #[error("cannot apply {transition:?} to a {state:?} connection")]
    UnexpectedTransition {
        state: ConnectionState,
        transition: Transition,
    },

    #[error("connection already belongs to session {0}")]
    AlreadyJoined(SessionId),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("session {0} is not stored")]
    UnknownSession(SessionId),

    #[error("no session ids left")]
    Exhausted,
}

/// Category carried by outbound `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Protocol,
    Busy,
    Storage,
}
