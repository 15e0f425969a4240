use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;

use crate::error::{EntityKind, GraphError};
use crate::repository::{GraphRepository, PersistedChange, StoredSession};
use crate::types::*;

// One session's nodes and edges. Mutations are last-write-wins in arrival
// order; there is no versioning.

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDeletion {
    pub node: Node,
    pub edge_ids: Vec<EdgeId>,
}

pub struct GraphStore {
    session_id: SessionId,
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    idx_edges_by_node: HashMap<NodeId, BTreeSet<EdgeId>>,
    next_node_id: NodeId,
    next_edge_id: EdgeId,
    allow_self_loops: bool,
    repository: Option<Arc<dyn GraphRepository>>,
}

impl GraphStore {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            idx_edges_by_node: HashMap::new(),
            next_node_id: 1,
            next_edge_id: 1,
            allow_self_loops: false,
            repository: None,
        }
    }

    /// Rebuilds a store from its durable form. Edges that point at missing
    /// nodes are dropped.
    pub fn from_stored(stored: StoredSession) -> Self {
        let session_id = stored.meta.id;
        let mut store = Self::new(session_id);
        store.next_node_id = stored.next_node_id;
        store.next_edge_id = stored.next_edge_id;
        for (id, node) in stored.nodes {
            store.next_node_id = store.next_node_id.max(id + 1);
            store.nodes.insert(id, node);
        }
        for (id, edge) in stored.edges {
            store.next_edge_id = store.next_edge_id.max(id + 1);
            if store.nodes.contains_key(&edge.source_id)
                && store.nodes.contains_key(&edge.target_id)
            {
                store.index_edge(&edge);
                store.edges.insert(id, edge);
            } else {
                log::warn!(
                    "Dropping dangling edge {} while loading session {}",
                    id,
                    session_id
                );
            }
        }
        store
    }

    pub fn with_repository(mut self, repository: Arc<dyn GraphRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn allow_self_loops(mut self, allow: bool) -> Self {
        self.allow_self_loops = allow;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edges_of(&self, node_id: &NodeId) -> Vec<EdgeId> {
        self.idx_edges_by_node
            .get(node_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn create_node(&mut self, new_node: NewNode) -> Result<Node, GraphError> {
        validate_position(new_node.x, new_node.y)?;
        validate_size(new_node.width, new_node.height)?;

        let id = self.next_node_id;
        self.next_node_id += 1;
        let node = Node {
            id,
            session_id: self.session_id,
            content: new_node.content,
            x: new_node.x,
            y: new_node.y,
            width: new_node.width,
            height: new_node.height,
            style: new_node.style,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.nodes.insert(id, node.clone());
        self.persist(PersistedChange::NodeUpserted(node.clone()));
        Ok(node)
    }

    pub fn update_node(&mut self, id: NodeId, patch: &NodePatch) -> Result<Node, GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::NotFound {
            entity: EntityKind::Node,
            id,
        })?;

        // Validate against the merged geometry before touching anything.
        validate_position(patch.x.unwrap_or(node.x), patch.y.unwrap_or(node.y))?;
        validate_size(
            patch.width.unwrap_or(node.width),
            patch.height.unwrap_or(node.height),
        )?;

        if let Some(content) = &patch.content {
            node.content = content.clone();
        }
        if let Some(x) = patch.x {
            node.x = x;
        }
        if let Some(y) = patch.y {
            node.y = y;
        }
        if let Some(width) = patch.width {
            node.width = width;
        }
        if let Some(height) = patch.height {
            node.height = height;
        }
        if let Some(style) = &patch.style {
            node.style = style.clone();
        }
        node.updated_at = Some(Utc::now());

        let node = node.clone();
        self.persist(PersistedChange::NodeUpserted(node.clone()));
        Ok(node)
    }

    pub fn delete_node(&mut self, id: NodeId) -> Result<NodeDeletion, GraphError> {
        let node = self.nodes.remove(&id).ok_or(GraphError::NotFound {
            entity: EntityKind::Node,
            id,
        })?;

        let edge_ids = self
            .idx_edges_by_node
            .remove(&id)
            .map(|ids| ids.into_iter().collect::<Vec<_>>())
            .unwrap_or_default();
        for edge_id in &edge_ids {
            if let Some(edge) = self.edges.remove(edge_id) {
                self.unindex_edge(&edge);
            }
        }

        self.persist(PersistedChange::NodeDeleted {
            node_id: id,
            edge_ids: edge_ids.clone(),
        });
        Ok(NodeDeletion { node, edge_ids })
    }

    pub fn create_edge(&mut self, source_id: NodeId, target_id: NodeId) -> Result<Edge, GraphError> {
        if !self.nodes.contains_key(&source_id) {
            return Err(GraphError::validation(format!(
                "source node {} does not exist",
                source_id
            )));
        }
        if !self.nodes.contains_key(&target_id) {
            return Err(GraphError::validation(format!(
                "target node {} does not exist",
                target_id
            )));
        }
        if source_id == target_id && !self.allow_self_loops {
            return Err(GraphError::validation(format!(
                "self-loop on node {} is not allowed",
                source_id
            )));
        }
        let duplicate = self
            .idx_edges_by_node
            .get(&source_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.edges.get(id))
                    .any(|e| e.source_id == source_id && e.target_id == target_id)
            })
            .unwrap_or(false);
        if duplicate {
            return Err(GraphError::validation("edge already exists"));
        }

        let id = self.next_edge_id;
        self.next_edge_id += 1;
        let edge = Edge {
            id,
            session_id: self.session_id,
            source_id,
            target_id,
            created_at: Utc::now(),
        };
        self.index_edge(&edge);
        self.edges.insert(id, edge.clone());
        self.persist(PersistedChange::EdgeUpserted(edge.clone()));
        Ok(edge)
    }

    pub fn delete_edge(&mut self, id: EdgeId) -> Result<Edge, GraphError> {
        let edge = self.edges.remove(&id).ok_or(GraphError::NotFound {
            entity: EntityKind::Edge,
            id,
        })?;
        self.unindex_edge(&edge);
        self.persist(PersistedChange::EdgeDeleted(id));
        Ok(edge)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    fn index_edge(&mut self, edge: &Edge) {
        self.idx_edges_by_node
            .entry(edge.source_id)
            .or_default()
            .insert(edge.id);
        self.idx_edges_by_node
            .entry(edge.target_id)
            .or_default()
            .insert(edge.id);
    }

    fn unindex_edge(&mut self, edge: &Edge) {
        for node_id in [edge.source_id, edge.target_id] {
            let should_delete_set = if let Some(ids) = self.idx_edges_by_node.get_mut(&node_id) {
                ids.remove(&edge.id);
                ids.is_empty()
            } else {
                false
            };
            if should_delete_set {
                self.idx_edges_by_node.remove(&node_id);
            }
        }
    }

    fn persist(&self, change: PersistedChange) {
        if let Some(repository) = &self.repository {
            if let Err(err) = repository.persist(self.session_id, &change) {
                log::error!(
                    "Failed to persist change for session {}: {}",
                    self.session_id,
                    err
                );
            }
        }
    }
}

fn validate_position(x: f64, y: f64) -> Result<(), GraphError> {
    if x.is_finite() && y.is_finite() {
        Ok(())
    } else {
        Err(GraphError::validation("position must be finite"))
    }
}

fn validate_size(width: f64, height: f64) -> Result<(), GraphError> {
    if width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0 {
        Ok(())
    } else {
        Err(GraphError::validation(format!(
            "size must be positive, got {}x{}",
            width, height
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn node_at(x: f64, y: f64) -> NewNode {
        NewNode {
            x,
            y,
            ..NewNode::default()
        }
    }

    #[test]
    fn it_assigns_increasing_ids() {
        let mut store = GraphStore::new(1);
        let a = store.create_node(NewNode::default()).expect("");
        let b = store.create_node(NewNode::default()).expect("");
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.session_id, 1);
    }

    #[test]
    fn it_never_reuses_deleted_ids() {
        let mut store = GraphStore::new(1);
        let a = store.create_node(NewNode::default()).expect("");
        store.delete_node(a.id).expect("");
        let b = store.create_node(NewNode::default()).expect("");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn it_rejects_invalid_geometry() {
        let mut store = GraphStore::new(1);
        let err = store
            .create_node(NewNode {
                width: -1.0,
                ..NewNode::default()
            })
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
        assert!(store
            .create_node(node_at(f64::NAN, 0.0))
            .is_err());
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn it_applies_only_patched_fields() {
        let mut store = GraphStore::new(1);
        let node = store
            .create_node(NewNode {
                content: "idea".into(),
                ..NewNode::default()
            })
            .expect("");

        let updated = store
            .update_node(
                node.id,
                &NodePatch {
                    x: Some(42.0),
                    ..NodePatch::default()
                },
            )
            .expect("");

        assert_eq!(updated.content, "idea");
        assert_eq!(updated.x, 42.0);
        assert_eq!(updated.y, node.y);
        assert!(updated.updated_at.is_some());
    }

    #[test]
    fn it_leaves_node_untouched_when_patch_is_invalid() {
        let mut store = GraphStore::new(1);
        let node = store.create_node(NewNode::default()).expect("");
        let err = store
            .update_node(
                node.id,
                &NodePatch {
                    content: Some("changed".into()),
                    height: Some(0.0),
                    ..NodePatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
        assert_eq!(store.node(&node.id), Some(&node));
    }

    #[test]
    fn it_reports_missing_nodes() {
        let mut store = GraphStore::new(1);
        assert_eq!(
            store.update_node(7, &NodePatch::default()).unwrap_err(),
            GraphError::NotFound {
                entity: EntityKind::Node,
                id: 7
            }
        );
        assert!(matches!(
            store.delete_node(7),
            Err(GraphError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_edge(7),
            Err(GraphError::NotFound { .. })
        ));
    }

    #[test]
    fn it_cascades_edges_on_node_deletion() {
        let mut store = GraphStore::new(1);
        let a = store.create_node(NewNode::default()).expect("");
        let b = store.create_node(NewNode::default()).expect("");
        let c = store.create_node(NewNode::default()).expect("");
        let ab = store.create_edge(a.id, b.id).expect("");
        let ca = store.create_edge(c.id, a.id).expect("");
        let bc = store.create_edge(b.id, c.id).expect("");

        let deletion = store.delete_node(a.id).expect("");
        assert_eq!(deletion.node.id, a.id);
        assert_eq!(deletion.edge_ids, vec![ab.id, ca.id]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].id, bc.id);
        assert!(snapshot.edges.iter().all(|e| !e.touches(a.id)));
        assert!(store.edges_of(&a.id).is_empty());
    }

    #[test]
    fn it_rejects_dangling_edges_without_changing_state() {
        let mut store = GraphStore::new(1);
        let a = store.create_node(NewNode::default()).expect("");
        let before = store.snapshot();
        let err = store.create_edge(a.id, 99).unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn it_rejects_self_loops_by_default() {
        let mut store = GraphStore::new(1);
        let a = store.create_node(NewNode::default()).expect("");
        assert!(store.create_edge(a.id, a.id).is_err());

        let mut permissive = GraphStore::new(2).allow_self_loops(true);
        let b = permissive.create_node(NewNode::default()).expect("");
        let edge = permissive.create_edge(b.id, b.id).expect("");
        let deletion = permissive.delete_node(b.id).expect("");
        assert_eq!(deletion.edge_ids, vec![edge.id]);
        assert_eq!(permissive.edge_count(), 0);
    }

    #[test]
    fn it_rejects_duplicate_edges_but_allows_reverse_direction() {
        let mut store = GraphStore::new(1);
        let a = store.create_node(NewNode::default()).expect("");
        let b = store.create_node(NewNode::default()).expect("");
        store.create_edge(a.id, b.id).expect("");
        assert_eq!(
            store.create_edge(a.id, b.id).unwrap_err(),
            GraphError::validation("edge already exists")
        );
        store.create_edge(b.id, a.id).expect("reverse edge is distinct");
        assert_eq!(store.edge_count(), 2);
    }

    #[test]
    fn it_persists_every_mutation() {
        let repo = Arc::new(MemoryRepository::new());
        repo.persist(
            3,
            &PersistedChange::SessionUpdated(SessionMeta::untitled(3)),
        )
        .expect("");
        let mut store = GraphStore::new(3).with_repository(repo.clone());
        let a = store.create_node(NewNode::default()).expect("");
        let b = store.create_node(NewNode::default()).expect("");
        store.create_edge(a.id, b.id).expect("");
        store.delete_node(b.id).expect("");

        let stored = repo.load(3).expect("").expect("stored");
        assert_eq!(stored.nodes.len(), 1);
        assert!(stored.edges.is_empty());

        let reloaded = GraphStore::from_stored(stored);
        assert_eq!(reloaded.snapshot(), store.snapshot());
        let mut reloaded = reloaded;
        let c = reloaded.create_node(NewNode::default()).expect("");
        assert_eq!(c.id, 3);
    }

    #[test]
    fn it_drops_dangling_edges_on_load() {
        let mut stored = StoredSession::new(SessionMeta::untitled(1));
        let edge = Edge {
            id: 5,
            session_id: 1,
            source_id: 1,
            target_id: 2,
            created_at: Utc::now(),
        };
        stored.edges.insert(edge.id, edge);
        let store = GraphStore::from_stored(stored);
        assert_eq!(store.edge_count(), 0);
        assert!(store.snapshot().dangling_edges().is_empty());
    }
}
