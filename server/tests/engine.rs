use std::sync::Arc;
use std::time::Duration;

use mindmap_server::config::EngineConfig;
use mindmap_server::connection::{ConnectionEvent, DisconnectReason};
use mindmap_server::connection_registry::ConnectionHandle;
use mindmap_server::server::{spawn_server, LookupError, ServerCommand, ServerTx};
use mindmap_server::session::SessionDescription;
use mindmap_server::session_worker::{SessionCommand, SessionTx};
use mindmap_system::{
    ClientMessage, ConnectionId, GraphRepository, MemoryRepository, NewNode, Participant,
    ServerEnvelope, ServerMessage, SessionId,
};
use tokio::sync::mpsc::{channel, Receiver};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Client {
    handle: ConnectionHandle,
    rx: Receiver<ConnectionEvent>,
    session_tx: Option<SessionTx>,
}

impl Client {
    fn new(connection_id: ConnectionId) -> Self {
        let (tx, rx) = channel(64);
        Self {
            handle: ConnectionHandle::new(connection_id, tx, CancellationToken::new()),
            rx,
            session_tx: None,
        }
    }

    async fn next(&mut self) -> ConnectionEvent {
        timeout(Duration::from_secs(60), self.rx.recv())
            .await
            .expect("event in time")
            .expect("connection queue open")
    }

    async fn next_envelope(&mut self) -> ServerEnvelope {
        match self.next().await {
            ConnectionEvent::Envelope(envelope) => envelope,
            other => panic!("expected an envelope, got {:?}", other),
        }
    }

    /// Joins and returns the snapshot.
    async fn join(
        &mut self,
        srv_tx: &ServerTx,
        session_id: SessionId,
        participant_id: &str,
    ) -> ServerMessage {
        srv_tx
            .send(ServerCommand::Join {
                connection: self.handle.clone(),
                request_id: Some(0),
                session_id,
                participant: Participant::new(participant_id, participant_id.to_uppercase()),
            })
            .await
            .expect("directory running");
        match self.next().await {
            ConnectionEvent::Attached { session_tx, .. } => self.session_tx = Some(session_tx),
            other => panic!("expected attach, got {:?}", other),
        }
        let envelope = self.next_envelope().await;
        assert_eq!(envelope.request_id, Some(0));
        assert!(matches!(envelope.event, ServerMessage::SessionSnapshot { .. }));
        envelope.event
    }

    async fn request(&self, request_id: u32, message: ClientMessage) {
        self.session()
            .send(SessionCommand::Request {
                from: self.handle.clone(),
                request_id: Some(request_id),
                message,
            })
            .await
            .expect("session running");
    }

    async fn drop_transport(&self) {
        self.session()
            .send(SessionCommand::TransportLost {
                from: self.handle.connection_id(),
            })
            .await
            .expect("session running");
    }

    fn session(&self) -> &SessionTx {
        self.session_tx.as_ref().expect("attached")
    }
}

fn idea() -> ClientMessage {
    ClientMessage::NodeCreate(NewNode {
        content: "idea".into(),
        x: 10.0,
        y: 10.0,
        width: 200.0,
        height: 100.0,
        ..NewNode::default()
    })
}

fn start(repository: Arc<MemoryRepository>) -> ServerTx {
    spawn_server(repository, EngineConfig::default())
}

async fn describe(
    srv_tx: &ServerTx,
    session_id: SessionId,
) -> Result<SessionDescription, LookupError> {
    let (tx, rx) = oneshot::channel();
    srv_tx
        .send(ServerCommand::DescribeSession { session_id, tx })
        .await
        .expect("directory running");
    rx.await.expect("answered")
}

#[tokio::test]
async fn it_bootstraps_a_late_joiner_with_the_current_graph() {
    let srv_tx = start(Arc::new(MemoryRepository::new()));
    let mut a = Client::new(1);
    a.join(&srv_tx, 1, "a").await;

    a.request(1, idea()).await;
    let created = a.next_envelope().await;
    assert_eq!(created.request_id, Some(1));
    match created.event {
        ServerMessage::NodeCreated { node } => {
            assert_eq!(node.id, 1);
            assert_eq!((node.x, node.y, node.width, node.height), (10.0, 10.0, 200.0, 100.0));
        }
        other => panic!("unexpected {:?}", other),
    }

    let mut b = Client::new(2);
    match b.join(&srv_tx, 1, "b").await {
        ServerMessage::SessionSnapshot {
            nodes, participants, ..
        } => {
            assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1]);
            assert_eq!(participants.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        a.next_envelope().await.event,
        ServerMessage::ParticipantJoined { participant } if participant.participant_id == "b"
    ));

    b.request(1, ClientMessage::NodeDelete { node_id: 1 }).await;
    assert_eq!(
        a.next_envelope().await,
        ServerEnvelope::broadcast(ServerMessage::NodeDeleted {
            node_id: 1,
            edge_ids: vec![]
        })
    );
}

#[tokio::test(start_paused = true)]
async fn it_keeps_presence_quiet_across_a_quick_reconnect() {
    let srv_tx = start(Arc::new(MemoryRepository::new()));
    let mut a = Client::new(1);
    let mut b = Client::new(2);
    a.join(&srv_tx, 1, "a").await;
    b.join(&srv_tx, 1, "b").await;
    a.next_envelope().await; // participant_joined b

    b.drop_transport().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let mut b_again = Client::new(3);
    b_again.join(&srv_tx, 1, "b").await;

    // Let the original grace window run out; the resume must win.
    tokio::time::sleep(Duration::from_secs(20)).await;

    a.request(1, idea()).await;
    assert!(matches!(
        a.next_envelope().await,
        ServerEnvelope {
            request_id: Some(1),
            event: ServerMessage::NodeCreated { .. }
        }
    ));
    assert!(matches!(
        b_again.next_envelope().await.event,
        ServerMessage::NodeCreated { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn it_announces_left_then_joined_after_the_grace_window() {
    let srv_tx = start(Arc::new(MemoryRepository::new()));
    let mut a = Client::new(1);
    let mut b = Client::new(2);
    a.join(&srv_tx, 1, "a").await;
    b.join(&srv_tx, 1, "b").await;
    a.next_envelope().await;

    b.drop_transport().await;
    match a.next_envelope().await.event {
        ServerMessage::ParticipantLeft { participant } => {
            assert_eq!(participant.participant_id, "b")
        }
        other => panic!("unexpected {:?}", other),
    }

    let mut b_again = Client::new(3);
    b_again.join(&srv_tx, 1, "b").await;
    match a.next_envelope().await.event {
        ServerMessage::ParticipantJoined { participant } => {
            assert_eq!(participant.participant_id, "b")
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn it_replaces_the_older_connection_of_a_participant() {
    let srv_tx = start(Arc::new(MemoryRepository::new()));
    let mut a = Client::new(1);
    let mut first = Client::new(2);
    a.join(&srv_tx, 1, "a").await;
    first.join(&srv_tx, 1, "b").await;
    a.next_envelope().await;

    let mut second = Client::new(3);
    second.join(&srv_tx, 1, "b").await;
    assert!(matches!(
        first.next().await,
        ConnectionEvent::Disconnected {
            reason: DisconnectReason::Replaced
        }
    ));

    a.request(1, idea()).await;
    assert!(matches!(
        a.next_envelope().await.event,
        ServerMessage::NodeCreated { .. }
    ));
    assert!(matches!(
        second.next_envelope().await.event,
        ServerMessage::NodeCreated { .. }
    ));
}

#[tokio::test]
async fn it_retires_an_empty_session_and_reloads_it_from_the_store() {
    let repository = Arc::new(MemoryRepository::new());
    let srv_tx = start(repository.clone());
    let mut a = Client::new(1);
    a.join(&srv_tx, 5, "a").await;
    a.request(1, idea()).await;
    a.next_envelope().await;

    let live = describe(&srv_tx, 5).await.expect("live session");
    assert!(live.live);
    assert_eq!(live.session.title, "Session 5");
    assert_eq!(live.node_count, 1);

    a.session()
        .send(SessionCommand::Leave {
            from: 1,
            request_id: Some(2),
            acknowledge: true,
        })
        .await
        .expect("session running");
    assert_eq!(
        a.next_envelope().await,
        ServerEnvelope::reply(Some(2), ServerMessage::SessionLeft { session_id: 5 })
    );

    let mut retired = false;
    for _ in 0..100 {
        if !describe(&srv_tx, 5).await.expect("stored").live {
            retired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(retired, "session worker was not retired");
    assert_eq!(repository.load(5).expect("").expect("stored").nodes.len(), 1);

    let mut b = Client::new(2);
    match b.join(&srv_tx, 5, "b").await {
        ServerMessage::SessionSnapshot { nodes, .. } => assert_eq!(nodes.len(), 1),
        other => panic!("unexpected {:?}", other),
    }
    b.request(1, idea()).await;
    match b.next_envelope().await.event {
        ServerMessage::NodeCreated { node } => assert_eq!(node.id, 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn it_reports_unknown_sessions_as_not_found() {
    let srv_tx = start(Arc::new(MemoryRepository::new()));
    assert!(matches!(
        describe(&srv_tx, 42).await,
        Err(LookupError::NotFound(42))
    ));
}

#[tokio::test(start_paused = true)]
async fn it_settles_a_transport_closed_before_the_attach_arrived() {
    let srv_tx = start(Arc::new(MemoryRepository::new()));
    let mut watcher = Client::new(1);
    watcher.join(&srv_tx, 1, "watcher").await;

    // The socket went away while the join was still in flight, so the
    // transport never learned its session and can only close its handle.
    let gone = Client::new(2);
    srv_tx
        .send(ServerCommand::Join {
            connection: gone.handle.clone(),
            request_id: None,
            session_id: 1,
            participant: Participant::new("gone", "Gone"),
        })
        .await
        .expect("directory running");
    gone.handle.close();

    assert!(matches!(
        watcher.next_envelope().await.event,
        ServerMessage::ParticipantJoined { participant } if participant.participant_id == "gone"
    ));
    assert!(matches!(
        watcher.next_envelope().await.event,
        ServerMessage::ParticipantLeft { participant } if participant.participant_id == "gone"
    ));
    let described = describe(&srv_tx, 1).await.expect("live");
    assert_eq!(
        described
            .participants
            .iter()
            .map(|p| p.participant_id.as_str())
            .collect::<Vec<_>>(),
        vec!["watcher"]
    );
}

#[tokio::test(start_paused = true)]
async fn it_retires_a_session_whose_only_transport_vanished() {
    let srv_tx = start(Arc::new(MemoryRepository::new()));
    let lonely = Client::new(1);
    srv_tx
        .send(ServerCommand::Join {
            connection: lonely.handle.clone(),
            request_id: None,
            session_id: 3,
            participant: Participant::new("a", "A"),
        })
        .await
        .expect("directory running");
    lonely.handle.close();

    tokio::time::sleep(Duration::from_secs(120)).await;
    let described = describe(&srv_tx, 3).await.expect("stored");
    assert!(!described.live);
    assert!(described.participants.is_empty());
}
