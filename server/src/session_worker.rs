use mindmap_system::{
    ClientMessage, ConnectionId, Participant, ParticipantId, RequestId, ServerEnvelope,
    ServerMessage, SessionId,
};
use tokio::sync::mpsc::{channel, Sender, WeakSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::connection_registry::ConnectionHandle;
use crate::server::{ServerCommand, ServerTx};
use crate::session::{Session, SessionDescription};

pub type SessionTx = Sender<SessionCommand>;

#[derive(Debug)]
pub enum SessionCommand {
    Join {
        connection: ConnectionHandle,
        request_id: Option<RequestId>,
        participant: Participant,
    },
    Request {
        from: ConnectionHandle,
        request_id: Option<RequestId>,
        message: ClientMessage,
    },
    Leave {
        from: ConnectionId,
        request_id: Option<RequestId>,
        acknowledge: bool,
    },
    TransportLost {
        from: ConnectionId,
    },
    GraceExpired {
        participant_id: ParticipantId,
        epoch: u64,
    },
    Describe {
        tx: oneshot::Sender<SessionDescription>,
    },
    Retire,
}

struct SessionWorker {
    session: Session,
    self_tx: WeakSender<SessionCommand>,
    srv_tx: ServerTx,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl SessionWorker {
    /// Returns `false` once the worker should stop.
    fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Join {
                connection,
                request_id,
                participant,
            } => {
                self.watch_transport(&connection);
                self.session.join(connection, participant, request_id);
            }
            SessionCommand::Request {
                from,
                request_id,
                message,
            } => {
                self.session.handle_request(&from, request_id, message);
            }
            SessionCommand::Leave {
                from,
                request_id,
                acknowledge,
            } => {
                if let Some(handle) = self.session.leave(from) {
                    if acknowledge {
                        handle.send_envelope(ServerEnvelope::reply(
                            request_id,
                            ServerMessage::SessionLeft {
                                session_id: self.session.id(),
                            },
                        ));
                    }
                }
            }
            SessionCommand::TransportLost { from } => {
                if let Some((participant_id, epoch)) = self.session.transport_lost(from) {
                    self.start_grace_timer(participant_id, epoch);
                }
            }
            SessionCommand::GraceExpired {
                participant_id,
                epoch,
            } => {
                self.session.expire(&participant_id, epoch);
            }
            SessionCommand::Describe { tx } => {
                let _ = tx.send(self.session.describe());
            }
            SessionCommand::Retire => {
                if self.session.is_empty() {
                    log::info!("Retiring session {}", self.session.id());
                    return false;
                }
                // A join slipped in after the idle notice; stay alive.
                log::debug!("Session {} is busy again, not retiring", self.session.id());
            }
        }

        for (participant_id, epoch) in self.session.reap_closed() {
            self.start_grace_timer(participant_id, epoch);
        }
        if self.session.is_empty() {
            let _ = self.srv_tx.try_send(ServerCommand::SessionIdle {
                session_id: self.session.id(),
                joins_seen: self.session.joins_seen(),
            });
        }
        true
    }

    /// Reports the transport as lost once its handle is closed, whoever
    /// closed it.
    fn watch_transport(&self, connection: &ConnectionHandle) {
        let from = connection.connection_id();
        let closed = connection.closed_token();
        let shutdown = self.shutdown.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {
                    if let Some(tx) = self_tx.upgrade() {
                        let _ = tx.send(SessionCommand::TransportLost { from }).await;
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    fn start_grace_timer(&self, participant_id: ParticipantId, epoch: u64) {
        let self_tx = self.self_tx.clone();
        let grace = self.config.reconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx
                    .send(SessionCommand::GraceExpired {
                        participant_id,
                        epoch,
                    })
                    .await;
            }
        });
    }
}

/// Runs the session on its own task. Commands are applied strictly in
/// arrival order, which is the session's total order of events.
pub fn spawn_session(session: Session, srv_tx: ServerTx, config: EngineConfig) -> SessionTx {
    let (session_tx, mut session_rx) = channel::<SessionCommand>(config.session_mailbox);
    let session_id: SessionId = session.id();

    let mut worker = SessionWorker {
        session,
        self_tx: session_tx.downgrade(),
        srv_tx,
        config,
        shutdown: CancellationToken::new(),
    };

    tokio::spawn(async move {
        log::info!("session {} worker - started", session_id);
        while let Some(command) = session_rx.recv().await {
            if !worker.handle_command(command) {
                break;
            }
        }
        worker.shutdown.cancel();
        log::info!("session {} worker - terminated", session_id);
    });

    session_tx
}
