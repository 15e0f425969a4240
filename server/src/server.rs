use std::collections::HashMap;
use std::sync::Arc;

use mindmap_system::{
    ErrorKind, GraphRepository, Participant, RequestId, RequestRef, ServerEnvelope,
    ServerMessage, SessionId,
};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;

use crate::config::EngineConfig;
use crate::connection::ConnectionEvent;
use crate::connection_registry::ConnectionHandle;
use crate::session::{Session, SessionDescription};
use crate::session_worker::{spawn_session, SessionCommand, SessionTx};

pub type ServerTx = Sender<ServerCommand>;

#[derive(Debug)]
pub enum ServerCommand {
    Join {
        connection: ConnectionHandle,
        request_id: Option<RequestId>,
        session_id: SessionId,
        participant: Participant,
    },
    SessionIdle {
        session_id: SessionId,
        joins_seen: u64,
    },
    DescribeSession {
        session_id: SessionId,
        tx: oneshot::Sender<Result<SessionDescription, LookupError>>,
    },
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("storage failure: {0}")]
    Storage(String),
}

struct SessionEntry {
    tx: SessionTx,
    joins_forwarded: u64,
}

/// Directory of live sessions. Spawns a worker on first join and lets it go
/// once every participant is gone.
struct Server {
    sessions: HashMap<SessionId, SessionEntry>,
    repository: Arc<dyn GraphRepository>,
    config: EngineConfig,
    self_tx: ServerTx,
}

impl Server {
    fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Join {
                connection,
                request_id,
                session_id,
                participant,
            } => self.join(connection, request_id, session_id, participant),
            ServerCommand::SessionIdle {
                session_id,
                joins_seen,
            } => {
                let idle = self
                    .sessions
                    .get(&session_id)
                    .map_or(false, |entry| entry.joins_forwarded == joins_seen);
                if idle {
                    if let Some(entry) = self.sessions.remove(&session_id) {
                        let _ = entry.tx.try_send(SessionCommand::Retire);
                    }
                }
            }
            ServerCommand::DescribeSession { session_id, tx } => {
                self.describe(session_id, tx);
            }
        }
    }

    fn join(
        &mut self,
        connection: ConnectionHandle,
        request_id: Option<RequestId>,
        session_id: SessionId,
        participant: Participant,
    ) {
        let request = RequestRef {
            request_id,
            kind: "join_session".to_string(),
        };
        let session_tx = match self.session_tx(session_id) {
            Ok(tx) => tx,
            Err(err) => {
                log::error!("Could not open session {}: {}", session_id, err);
                connection.send(ConnectionEvent::JoinRejected(ServerEnvelope::reply(
                    request_id,
                    ServerMessage::error(ErrorKind::Storage, err.to_string(), Some(request)),
                )));
                return;
            }
        };

        connection.send(ConnectionEvent::Attached {
            session_id,
            session_tx: session_tx.clone(),
        });
        let forwarded = session_tx.try_send(SessionCommand::Join {
            connection: connection.clone(),
            request_id,
            participant,
        });
        match forwarded {
            Ok(()) => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.joins_forwarded += 1;
                }
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Session {} mailbox is full, rejecting join", session_id);
                connection.send(ConnectionEvent::JoinRejected(ServerEnvelope::reply(
                    request_id,
                    ServerMessage::error(
                        ErrorKind::Busy,
                        format!("session {} is busy", session_id),
                        Some(request),
                    ),
                )));
            }
            Err(TrySendError::Closed(_)) => {
                log::error!("Session {} worker is gone", session_id);
                self.sessions.remove(&session_id);
                connection.send(ConnectionEvent::JoinRejected(ServerEnvelope::reply(
                    request_id,
                    ServerMessage::error(
                        ErrorKind::Busy,
                        format!("session {} is restarting, retry", session_id),
                        Some(request),
                    ),
                )));
            }
        }
    }

    fn session_tx(&mut self, session_id: SessionId) -> Result<SessionTx, LookupError> {
        if let Some(entry) = self.sessions.get(&session_id) {
            return Ok(entry.tx.clone());
        }
        let session = Session::open(session_id, self.repository.clone(), &self.config)
            .map_err(|err| LookupError::Storage(err.to_string()))?;
        let tx = spawn_session(session, self.self_tx.clone(), self.config.clone());
        self.sessions.insert(
            session_id,
            SessionEntry {
                tx: tx.clone(),
                joins_forwarded: 0,
            },
        );
        Ok(tx)
    }

    fn describe(
        &self,
        session_id: SessionId,
        tx: oneshot::Sender<Result<SessionDescription, LookupError>>,
    ) {
        if let Some(entry) = self.sessions.get(&session_id) {
            let session_tx = entry.tx.clone();
            // The worker answers directly; the hub never waits on a session.
            tokio::spawn(async move {
                let (describe_tx, describe_rx) = oneshot::channel();
                let answer = match session_tx
                    .send(SessionCommand::Describe { tx: describe_tx })
                    .await
                {
                    Ok(()) => describe_rx
                        .await
                        .map_err(|_| LookupError::NotFound(session_id)),
                    Err(_) => Err(LookupError::NotFound(session_id)),
                };
                let _ = tx.send(answer);
            });
            return;
        }

        let answer = match self.repository.load(session_id) {
            Ok(Some(stored)) => Ok(SessionDescription::offline(&stored)),
            Ok(None) => Err(LookupError::NotFound(session_id)),
            Err(err) => Err(LookupError::Storage(err.to_string())),
        };
        let _ = tx.send(answer);
    }
}

pub fn spawn_server(repository: Arc<dyn GraphRepository>, config: EngineConfig) -> ServerTx {
    let (srv_tx, mut srv_rx) = channel::<ServerCommand>(config.session_mailbox);

    let mut server = Server {
        sessions: HashMap::new(),
        repository,
        config,
        self_tx: srv_tx.clone(),
    };

    tokio::spawn(async move {
        log::info!("session directory - started");
        while let Some(command) = srv_rx.recv().await {
            server.handle_command(command);
        }
        log::info!("session directory - terminated");
    });

    srv_tx
}
