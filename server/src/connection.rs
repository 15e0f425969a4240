use std::sync::atomic::{AtomicU32, Ordering};

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use actix_web_actors::ws::{CloseCode, CloseReason};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver};
use tokio_util::sync::CancellationToken;

use mindmap_system::{
    decode_client_bytes, decode_client_text, encode_server, ClientEnvelope, ClientMessage,
    ConnectionId, ConnectionState, ErrorKind, Participant, ProtocolError, RequestId, RequestRef,
    ServerEnvelope, ServerMessage, SessionId, Transition,
};

use crate::config::TransportConfig;
use crate::connection_registry::ConnectionHandle;
use crate::server::{ServerCommand, ServerTx};
use crate::session_worker::{SessionCommand, SessionTx};

/// Everything the engine pushes to one connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Attached {
        session_id: SessionId,
        session_tx: SessionTx,
    },
    JoinRejected(ServerEnvelope),
    Envelope(ServerEnvelope),
    Disconnected { reason: DisconnectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The same participant joined again on another connection.
    Replaced,
    /// The outbound queue overflowed.
    Lagging,
    ProtocolViolation,
}

#[derive(Debug, Default)]
pub struct ConnectionIdSource(AtomicU32);

impl ConnectionIdSource {
    pub fn next(&self) -> ConnectionId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// What the socket has to do after the link handled an input.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Send(ServerEnvelope),
    /// Close frame, then stop.
    Close {
        code: CloseCode,
        description: &'static str,
    },
    Stop,
}

/// Transport-side half of a connection: lifecycle state, the session it is
/// attached to and the routing of client frames. Knows nothing about the
/// socket itself.
pub struct ConnectionLink {
    state: ConnectionState,
    handle: ConnectionHandle,
    session: Option<(SessionId, SessionTx)>,
    srv_tx: ServerTx,
}

impl ConnectionLink {
    pub fn new(handle: ConnectionHandle, srv_tx: ServerTx) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            handle,
            session: None,
            srv_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|(id, _)| *id)
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    fn connection_id(&self) -> ConnectionId {
        self.handle.connection_id()
    }

    pub fn opened(&mut self) {
        self.state = self
            .state
            .apply(Transition::TransportOpened)
            .unwrap_or(ConnectionState::Connecting);
        log::debug!("Connection {} opened", self.connection_id());
    }

    /// The socket is gone. Tells the session when attached to one; the closed
    /// handle covers a join that is still in flight.
    pub fn closed(&mut self) {
        if let Some((_, session_tx)) = self.session.take() {
            if self.state.is_attached() {
                let _ = session_tx.try_send(SessionCommand::TransportLost {
                    from: self.connection_id(),
                });
            }
        }
        self.state = self
            .state
            .apply(Transition::TransportLost)
            .unwrap_or(ConnectionState::Disconnected);
        self.handle.close();
        log::debug!("Connection {} closed", self.connection_id());
    }

    pub fn on_frame(&mut self, frame: Result<ClientEnvelope, ProtocolError>) -> Vec<Outcome> {
        let ClientEnvelope {
            request_id,
            message,
        } = match frame {
            Ok(envelope) => envelope,
            Err(err) => return self.violate(None, err, None),
        };
        log::debug!(
            "Ingress {} on connection {}",
            message.kind(),
            self.connection_id()
        );

        match message {
            ClientMessage::JoinSession {
                session_id,
                participant_id,
                display_name,
            } => self.join(request_id, session_id, participant_id, display_name),
            ClientMessage::LeaveSession => self.leave(request_id),
            message => self.forward(request_id, message),
        }
    }

    pub fn on_event(&mut self, event: ConnectionEvent) -> Vec<Outcome> {
        match event {
            ConnectionEvent::Attached {
                session_id,
                session_tx,
            } => {
                if self.state == ConnectionState::Joined {
                    self.session = Some((session_id, session_tx));
                }
                vec![]
            }
            ConnectionEvent::JoinRejected(envelope) => {
                self.session = None;
                self.state = self
                    .state
                    .apply(Transition::JoinRejected)
                    .unwrap_or(ConnectionState::Connecting);
                vec![Outcome::Send(envelope)]
            }
            ConnectionEvent::Envelope(envelope) => {
                if let ServerMessage::SessionSnapshot { .. } = envelope.event {
                    if self.state == ConnectionState::Joined {
                        self.state = ConnectionState::Active;
                    }
                }
                vec![Outcome::Send(envelope)]
            }
            ConnectionEvent::Disconnected { reason } => {
                log::info!(
                    "Closing connection {}: {:?}",
                    self.connection_id(),
                    reason
                );
                match reason {
                    DisconnectReason::Replaced => {
                        self.session = None;
                        vec![Outcome::Close {
                            code: CloseCode::Normal,
                            description: "replaced",
                        }]
                    }
                    DisconnectReason::Lagging => vec![Outcome::Close {
                        code: CloseCode::Again,
                        description: "lagging",
                    }],
                    DisconnectReason::ProtocolViolation => self.fail(),
                }
            }
        }
    }

    fn join(
        &mut self,
        request_id: Option<RequestId>,
        session_id: SessionId,
        participant_id: String,
        display_name: String,
    ) -> Vec<Outcome> {
        let request = RequestRef {
            request_id,
            kind: "join_session".to_string(),
        };
        if let Some(joined) = self.session_id() {
            return self.violate(request_id, ProtocolError::AlreadyJoined(joined), Some(request));
        }
        if participant_id.trim().is_empty() {
            return vec![Outcome::Send(ServerEnvelope::reply(
                request_id,
                ServerMessage::error(
                    ErrorKind::Validation,
                    "participant_id must not be blank",
                    Some(request),
                ),
            ))];
        }
        match self.state.apply(Transition::JoinAccepted) {
            Ok(next) => self.state = next,
            Err(err) => return self.violate(request_id, err, Some(request)),
        }

        let command = ServerCommand::Join {
            connection: self.handle.clone(),
            request_id,
            session_id,
            participant: Participant::new(participant_id, display_name),
        };
        if let Err(err) = self.srv_tx.try_send(command) {
            log::warn!(
                "Could not hand join of connection {} to the directory: {}",
                self.connection_id(),
                err
            );
            self.state = ConnectionState::Connecting;
            return vec![Outcome::Send(ServerEnvelope::reply(
                request_id,
                ServerMessage::error(ErrorKind::Busy, "server is busy, retry", Some(request)),
            ))];
        }
        vec![]
    }

    fn leave(&mut self, request_id: Option<RequestId>) -> Vec<Outcome> {
        match (self.state, self.session.take()) {
            (ConnectionState::Active, Some((_, session_tx))) => {
                let _ = session_tx.try_send(SessionCommand::Leave {
                    from: self.connection_id(),
                    request_id,
                    acknowledge: true,
                });
                self.state = ConnectionState::Active
                    .apply(Transition::Left)
                    .unwrap_or(ConnectionState::Connecting);
                vec![]
            }
            (state, session) => {
                self.session = session;
                let request = RequestRef {
                    request_id,
                    kind: "leave_session".to_string(),
                };
                let err = ProtocolError::NotActive {
                    state,
                    request: "leave_session",
                };
                self.violate(request_id, err, Some(request))
            }
        }
    }

    fn forward(&mut self, request_id: Option<RequestId>, message: ClientMessage) -> Vec<Outcome> {
        let request = RequestRef {
            request_id,
            kind: message.kind().to_string(),
        };
        let session_tx = match &self.session {
            Some((_, session_tx)) if self.state.is_active() => session_tx.clone(),
            _ => {
                let err = ProtocolError::NotActive {
                    state: self.state,
                    request: message.kind(),
                };
                return self.violate(request_id, err, Some(request));
            }
        };

        let command = SessionCommand::Request {
            from: self.handle.clone(),
            request_id,
            message,
        };
        match session_tx.try_send(command) {
            Ok(()) => vec![],
            Err(TrySendError::Full(_)) => vec![Outcome::Send(ServerEnvelope::reply(
                request_id,
                ServerMessage::error(ErrorKind::Busy, "session is busy, retry", Some(request)),
            ))],
            Err(TrySendError::Closed(_)) => {
                log::warn!(
                    "Session of connection {} is gone, closing",
                    self.connection_id()
                );
                vec![Outcome::Stop]
            }
        }
    }

    /// Fatal to the connection: forces leave processing and closes the
    /// transport.
    fn violate(
        &mut self,
        request_id: Option<RequestId>,
        err: ProtocolError,
        request: Option<RequestRef>,
    ) -> Vec<Outcome> {
        log::warn!(
            "Protocol violation on connection {}: {}",
            self.connection_id(),
            err
        );
        let mut outcomes = vec![Outcome::Send(ServerEnvelope::reply(
            request_id,
            ServerMessage::protocol_error(&err, request),
        ))];
        outcomes.extend(self.fail());
        outcomes
    }

    fn fail(&mut self) -> Vec<Outcome> {
        if let Some((_, session_tx)) = self.session.take() {
            let _ = session_tx.try_send(SessionCommand::Leave {
                from: self.connection_id(),
                request_id: None,
                acknowledge: false,
            });
        }
        self.state = self
            .state
            .apply(Transition::Violation)
            .unwrap_or(ConnectionState::Error);
        vec![Outcome::Close {
            code: CloseCode::Policy,
            description: "protocol violation",
        }]
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct ConnectionActorMessage(ConnectionEvent);

struct ConnectionActor {
    link: ConnectionLink,
    rx: Option<Receiver<ConnectionEvent>>,
}

impl ConnectionActor {
    fn perform(&self, outcomes: Vec<Outcome>, ctx: &mut ws::WebsocketContext<Self>) {
        for outcome in outcomes {
            match outcome {
                Outcome::Send(envelope) => match encode_server(&envelope) {
                    Ok(text) => ctx.text(text),
                    Err(err) => log::error!(
                        "Could not encode {:?} for connection {}: {}",
                        envelope.event,
                        self.link.connection_id(),
                        err
                    ),
                },
                Outcome::Close { code, description } => {
                    ctx.close(Some(CloseReason {
                        code,
                        description: Some(description.into()),
                    }));
                    ctx.stop();
                }
                Outcome::Stop => ctx.stop(),
            }
        }
    }
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.link.opened();

        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let closed = self.link.handle().closed_token();
        let addr = ctx.address().recipient();

        tokio::spawn(async move {
            log::debug!("connection green thread - started");
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => addr.do_send(ConnectionActorMessage(event)),
                        None => break,
                    },
                    _ = closed.cancelled() => {
                        addr.do_send(ConnectionActorMessage(ConnectionEvent::Disconnected {
                            reason: DisconnectReason::Lagging,
                        }));
                        break;
                    }
                }
            }
            log::debug!("connection green thread - terminated");
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.link.closed();
        Running::Stop
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let frame = match msg {
            Ok(ws::Message::Ping(msg)) => {
                ctx.pong(&msg);
                return;
            }
            Ok(ws::Message::Text(text)) => decode_client_text(&text),
            Ok(ws::Message::Binary(bin)) => decode_client_bytes(&bin),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
                return;
            }
            Ok(_) => return,
            Err(err) => {
                log::warn!(
                    "Transport error on connection {}: {}",
                    self.link.connection_id(),
                    err
                );
                ctx.stop();
                return;
            }
        };
        let outcomes = self.link.on_frame(frame);
        self.perform(outcomes, ctx);
    }
}

/// Egress
impl Handler<ConnectionActorMessage> for ConnectionActor {
    type Result = ();

    fn handle(
        &mut self,
        msg: ConnectionActorMessage,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Self::Result {
        let outcomes = self.link.on_event(msg.0);
        self.perform(outcomes, ctx);
    }
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    srv_tx: web::Data<ServerTx>,
    ids: web::Data<ConnectionIdSource>,
    transport: web::Data<TransportConfig>,
) -> Result<HttpResponse, Error> {
    let (tx, rx) = channel::<ConnectionEvent>(transport.outbound_buffer);
    let handle = ConnectionHandle::new(ids.next(), tx, CancellationToken::new());
    ws::start(
        ConnectionActor {
            link: ConnectionLink::new(handle, srv_tx.get_ref().clone()),
            rx: Some(rx),
        },
        &req,
        stream,
    )
}
