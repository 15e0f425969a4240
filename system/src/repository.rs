use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;
use crate::types::{Edge, EdgeId, Node, NodeId, SessionId, SessionMeta};

/// One durable write, emitted after every successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PersistedChange {
    SessionUpdated(SessionMeta),
    NodeUpserted(Node),
    NodeDeleted { node_id: NodeId, edge_ids: Vec<EdgeId> },
    EdgeUpserted(Edge),
    EdgeDeleted(EdgeId),
}

/// Durable form of a session. Carries the id watermarks so that ids of
/// deleted entities are never handed out again after a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub meta: SessionMeta,
    pub nodes: BTreeMap<NodeId, Node>,
    pub edges: BTreeMap<EdgeId, Edge>,
    pub next_node_id: NodeId,
    pub next_edge_id: EdgeId,
}

impl StoredSession {
    pub fn new(meta: SessionMeta) -> Self {
        Self {
            meta,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            next_node_id: 1,
            next_edge_id: 1,
        }
    }

    pub fn apply(&mut self, change: &PersistedChange) {
        match change {
            PersistedChange::SessionUpdated(meta) => {
                self.meta = meta.clone();
            }
            PersistedChange::NodeUpserted(node) => {
                self.next_node_id = self.next_node_id.max(node.id + 1);
                self.nodes.insert(node.id, node.clone());
            }
            PersistedChange::NodeDeleted { node_id, edge_ids } => {
                self.nodes.remove(node_id);
                for edge_id in edge_ids {
                    self.edges.remove(edge_id);
                }
            }
            PersistedChange::EdgeUpserted(edge) => {
                self.next_edge_id = self.next_edge_id.max(edge.id + 1);
                self.edges.insert(edge.id, edge.clone());
            }
            PersistedChange::EdgeDeleted(edge_id) => {
                self.edges.remove(edge_id);
            }
        }
    }
}

/// Narrow contract between the engine and whatever keeps sessions durable.
pub trait GraphRepository: Send + Sync {
    fn load(&self, session_id: SessionId) -> Result<Option<StoredSession>, RepositoryError>;

    fn persist(&self, session_id: SessionId, change: &PersistedChange)
        -> Result<(), RepositoryError>;

    fn sessions(&self) -> Result<Vec<SessionMeta>, RepositoryError>;

    fn create_session(&self, title: &str) -> Result<SessionMeta, RepositoryError>;
}

/// Sessions keyed by id; the bookkeeping shared by every repository.
#[derive(Debug, Default)]
pub struct SessionCatalog {
    sessions: BTreeMap<SessionId, StoredSession>,
}

impl SessionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&StoredSession> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn insert(&mut self, stored: StoredSession) {
        self.sessions.insert(stored.meta.id, stored);
    }

    /// A `SessionUpdated` change for an unknown id creates the session; any
    /// other change for an unknown id is an error.
    pub fn apply(
        &mut self,
        session_id: SessionId,
        change: &PersistedChange,
    ) -> Result<&StoredSession, RepositoryError> {
        if !self.sessions.contains_key(&session_id) {
            match change {
                PersistedChange::SessionUpdated(meta) => {
                    self.sessions
                        .insert(session_id, StoredSession::new(meta.clone()));
                }
                _ => return Err(RepositoryError::UnknownSession(session_id)),
            }
        }
        let stored = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RepositoryError::UnknownSession(session_id))?;
        stored.apply(change);
        Ok(stored)
    }

    /// One past the highest known id. Fails once `SessionId::MAX` is taken.
    pub fn next_session_id(&self) -> Result<SessionId, RepositoryError> {
        match self.sessions.keys().next_back() {
            Some(id) => id.checked_add(1).ok_or(RepositoryError::Exhausted),
            None => Ok(1),
        }
    }

    pub fn metas(&self) -> Vec<SessionMeta> {
        self.sessions.values().map(|s| s.meta.clone()).collect()
    }
}

/// Keeps everything in process memory. Used when no data directory is set
/// and throughout the tests.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    catalog: Mutex<SessionCatalog>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphRepository for MemoryRepository {
    fn load(&self, session_id: SessionId) -> Result<Option<StoredSession>, RepositoryError> {
        Ok(self.catalog.lock().get(&session_id).cloned())
    }

    fn persist(
        &self,
        session_id: SessionId,
        change: &PersistedChange,
    ) -> Result<(), RepositoryError> {
        self.catalog.lock().apply(session_id, change).map(|_| ())
    }

    fn sessions(&self) -> Result<Vec<SessionMeta>, RepositoryError> {
        Ok(self.catalog.lock().metas())
    }

    fn create_session(&self, title: &str) -> Result<SessionMeta, RepositoryError> {
        let mut catalog = self.catalog.lock();
        let meta = SessionMeta::new(catalog.next_session_id()?, title);
        catalog.insert(StoredSession::new(meta.clone()));
        Ok(meta)
    }
}
