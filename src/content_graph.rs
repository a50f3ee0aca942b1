// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A generic, directed, multi-labeled graph keyed by stable string content keys.
//!
//! This is deliberately the dumbest layer of the stack: it knows nothing about request
//! lifecycles or invalidation reasons, only about deduplicating nodes by value and answering
//! incidence queries for a given edge label. [`crate::request_graph::RequestGraph`] builds the
//! typed schema on top of it.
//!
//! Node identity is a monotonic counter (`NodeId`, see `schema.rs`) kept independent of
//! `petgraph`'s own storage index: `StableDiGraph` avoids shifting *other* nodes' indices on
//! removal, but it does recycle a removed slot for a later `add_node`, which would violate the
//! "ids are never reused" invariant if `NodeId` were petgraph's index directly. Here petgraph's
//! index is purely an internal storage detail behind `index_of`/`id_of`.

use fnv::FnvHashMap as HashMap;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::schema::NodeId;

/// Anything storable in a `ContentGraph` must be able to name itself by a content key that is
/// stable for the node's lifetime (used to dedupe on `add_node_by_content_key`, and to purge the
/// key index on `remove_node`).
pub trait ContentAddressable {
    fn content_key(&self) -> String;
}

type PIndex = NodeIndex<u32>;
type PGraph<N, L> = StableDiGraph<N, L, u32>;

/// A content-addressed directed graph. `N` is the node payload, `L` is the edge label type
/// (expected to be a small `Copy + Eq` enum).
pub struct ContentGraph<N, L> {
    by_key: HashMap<String, NodeId>,
    graph: PGraph<N, L>,
    index_of: HashMap<NodeId, PIndex>,
    id_of: HashMap<PIndex, NodeId>,
    next_id: u64,
}

impl<N, L> Default for ContentGraph<N, L> {
    fn default() -> Self {
        ContentGraph {
            by_key: HashMap::default(),
            graph: PGraph::default(),
            index_of: HashMap::default(),
            id_of: HashMap::default(),
            next_id: 0,
        }
    }
}

impl<N: ContentAddressable, L: Copy + Eq> ContentGraph<N, L> {
    pub fn new() -> ContentGraph<N, L> {
        ContentGraph::default()
    }

    /// If `key` is already present, returns its existing id (idempotent). Otherwise allocates a
    /// new id and stores `node`.
    pub fn add_node_by_content_key(&mut self, key: String, node: N) -> NodeId {
        if let Some(&id) = self.by_key.get(&key) {
            return id;
        }
        let pidx = self.graph.add_node(node);
        let id = NodeId::from_raw(self.next_id);
        self.next_id += 1;
        self.index_of.insert(id, pidx);
        self.id_of.insert(pidx, id);
        self.by_key.insert(key, id);
        id
    }

    /// Inserts `node` under exactly `id`, bypassing the monotonic allocator entirely. Used only to
    /// restore a persisted graph, where `id` must match the id it was serialized under rather than
    /// whatever the allocator would hand out next; `set_next_id` is called once afterward to
    /// resume minting past the highest id the persisted graph used.
    pub fn insert_with_id(&mut self, id: NodeId, key: String, node: N) {
        let pidx = self.graph.add_node(node);
        self.index_of.insert(id, pidx);
        self.id_of.insert(pidx, id);
        self.by_key.insert(key, id);
    }

    /// The next id `add_node_by_content_key` would allocate. `Persistence` serializes this
    /// alongside the graph so a restored graph resumes minting ids where the persisted one left
    /// off, rather than colliding with ids it just restored.
    pub fn next_id_raw(&self) -> u64 {
        self.next_id
    }

    /// Overrides the allocator's counter directly; see `insert_with_id`.
    pub fn set_next_id(&mut self, next_id: u64) {
        self.next_id = next_id;
    }

    fn pidx(&self, id: NodeId) -> Option<PIndex> {
        self.index_of.get(&id).copied()
    }

    pub fn get_node(&self, id: NodeId) -> Option<&N> {
        self.graph.node_weight(self.pidx(id)?)
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut N> {
        let pidx = self.pidx(id)?;
        self.graph.node_weight_mut(pidx)
    }

    pub fn get_node_by_content_key(&self, key: &str) -> Option<&N> {
        self.by_key.get(key).and_then(|&id| self.get_node(id))
    }

    pub fn id_for_content_key(&self, key: &str) -> Option<NodeId> {
        self.by_key.get(key).copied()
    }

    pub fn has_content_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.index_of.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.index_of.len()
    }

    /// Every `(id, node)` pair currently in the graph, in unspecified order.
    pub fn all_nodes(&self) -> impl Iterator<Item = (NodeId, &N)> + '_ {
        self.index_of
            .iter()
            .filter_map(|(&id, &pidx)| self.graph.node_weight(pidx).map(|n| (id, n)))
    }

    /// At-most-one edge per (from, to, label): callers don't need to pre-check `has_edge`
    /// themselves, though the typed layer above still does so explicitly to match the spec's
    /// "edges must be add-once" wording.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, label: L) {
        let (Some(pfrom), Some(pto)) = (self.pidx(from), self.pidx(to)) else {
            return;
        };
        let exists = self
            .graph
            .edges_connecting(pfrom, pto)
            .any(|e| *e.weight() == label);
        if !exists {
            self.graph.add_edge(pfrom, pto, label);
        }
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId, label: L) -> bool {
        let (Some(pfrom), Some(pto)) = (self.pidx(from), self.pidx(to)) else {
            return false;
        };
        self.graph
            .edges_connecting(pfrom, pto)
            .any(|e| *e.weight() == label)
    }

    pub fn remove_edge(&mut self, from: NodeId, to: NodeId, label: L) {
        let (Some(pfrom), Some(pto)) = (self.pidx(from), self.pidx(to)) else {
            return;
        };
        if let Some(edge_id) = self
            .graph
            .edges_connecting(pfrom, pto)
            .find(|e| *e.weight() == label)
            .map(|e| e.id())
        {
            self.graph.remove_edge(edge_id);
        }
    }

    /// Outgoing neighbors of `id` reachable via an edge labeled `label`.
    pub fn node_ids_connected_from(&self, id: NodeId, label: L) -> Vec<NodeId> {
        let Some(pidx) = self.pidx(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(pidx, Direction::Outgoing)
            .filter(|e| *e.weight() == label)
            .filter_map(|e| self.id_of.get(&e.target()).copied())
            .collect()
    }

    /// Incoming neighbors of `id` reachable via an edge labeled `label`.
    pub fn node_ids_connected_to(&self, id: NodeId, label: L) -> Vec<NodeId> {
        let Some(pidx) = self.pidx(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(pidx, Direction::Incoming)
            .filter(|e| *e.weight() == label)
            .filter_map(|e| self.id_of.get(&e.source()).copied())
            .collect()
    }

    /// Replaces the set of incoming edges on `label` with exactly `new_ids`: computes the
    /// add/remove diff against the current set and applies only the edges that changed.
    pub fn replace_node_ids_connected_to<I: IntoIterator<Item = NodeId>>(
        &mut self,
        id: NodeId,
        new_ids: I,
        label: L,
    ) {
        let current: std::collections::HashSet<NodeId> =
            self.node_ids_connected_to(id, label).into_iter().collect();
        let new: std::collections::HashSet<NodeId> = new_ids.into_iter().collect();

        for &removed in current.difference(&new) {
            self.remove_edge(removed, id, label);
        }
        for &added in new.difference(&current) {
            self.add_edge(added, id, label);
        }
    }

    /// Replaces the set of outgoing edges on `label` with exactly `new_ids`: computes the
    /// add/remove diff against the current set and applies only the edges that changed.
    pub fn replace_node_ids_connected_from<I: IntoIterator<Item = NodeId>>(
        &mut self,
        id: NodeId,
        new_ids: I,
        label: L,
    ) {
        let current: std::collections::HashSet<NodeId> =
            self.node_ids_connected_from(id, label).into_iter().collect();
        let new: std::collections::HashSet<NodeId> = new_ids.into_iter().collect();

        for &removed in current.difference(&new) {
            self.remove_edge(id, removed, label);
        }
        for &added in new.difference(&current) {
            self.add_edge(id, added, label);
        }
    }

    /// True if `id` has any incident edge at all, incoming or outgoing, regardless of label.
    pub fn has_any_incident_edge(&self, id: NodeId) -> bool {
        let Some(pidx) = self.pidx(id) else {
            return false;
        };
        self.graph.edges_directed(pidx, Direction::Outgoing).next().is_some()
            || self.graph.edges_directed(pidx, Direction::Incoming).next().is_some()
    }

    /// Detaches `id` from every incident edge and removes it from the content-key index. The
    /// underlying petgraph slot is freed (and may be reused by petgraph internally), but `id`
    /// itself is never reissued since `next_id` only ever increases.
    pub fn remove_node(&mut self, id: NodeId) -> Option<N> {
        let pidx = self.index_of.remove(&id)?;
        self.id_of.remove(&pidx);
        let node = self.graph.remove_node(pidx)?;
        let key = node.content_key();
        self.by_key.remove(&key);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Eq, PartialEq)]
    struct Str(String);

    impl ContentAddressable for Str {
        fn content_key(&self) -> String {
            self.0.clone()
        }
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum Label {
        A,
        B,
    }

    #[test]
    fn add_node_by_content_key_is_idempotent() {
        let mut g: ContentGraph<Str, Label> = ContentGraph::new();
        let id1 = g.add_node_by_content_key("x".to_string(), Str("x".to_string()));
        let id2 = g.add_node_by_content_key("x".to_string(), Str("x-again".to_string()));
        assert_eq!(id1, id2);
        assert_eq!(g.node_count(), 1);
        // The original payload is retained; the second call was a no-op.
        assert_eq!(g.get_node(id1).unwrap().0, "x");
    }

    #[test]
    fn add_edge_is_idempotent_per_label() {
        let mut g: ContentGraph<Str, Label> = ContentGraph::new();
        let a = g.add_node_by_content_key("a".to_string(), Str("a".to_string()));
        let b = g.add_node_by_content_key("b".to_string(), Str("b".to_string()));
        g.add_edge(a, b, Label::A);
        g.add_edge(a, b, Label::A);
        assert_eq!(g.node_ids_connected_from(a, Label::A), vec![b]);

        g.add_edge(a, b, Label::B);
        assert_eq!(g.node_ids_connected_from(a, Label::A), vec![b]);
        assert_eq!(g.node_ids_connected_from(a, Label::B), vec![b]);
    }

    #[test]
    fn remove_node_purges_key_index_and_edges() {
        let mut g: ContentGraph<Str, Label> = ContentGraph::new();
        let a = g.add_node_by_content_key("a".to_string(), Str("a".to_string()));
        let b = g.add_node_by_content_key("b".to_string(), Str("b".to_string()));
        g.add_edge(a, b, Label::A);

        g.remove_node(a);
        assert!(!g.has_content_key("a"));
        assert!(!g.has_node(a));
        assert_eq!(g.node_ids_connected_to(b, Label::A), Vec::new());
    }

    #[test]
    fn replace_connected_to_computes_add_remove_diff() {
        let mut g: ContentGraph<Str, Label> = ContentGraph::new();
        let target = g.add_node_by_content_key("t".to_string(), Str("t".to_string()));
        let p1 = g.add_node_by_content_key("p1".to_string(), Str("p1".to_string()));
        let p2 = g.add_node_by_content_key("p2".to_string(), Str("p2".to_string()));
        let p3 = g.add_node_by_content_key("p3".to_string(), Str("p3".to_string()));

        g.add_edge(p1, target, Label::A);
        g.add_edge(p2, target, Label::A);

        g.replace_node_ids_connected_to(target, vec![p2, p3], Label::A);

        let mut connected = g.node_ids_connected_to(target, Label::A);
        connected.sort();
        let mut expected = vec![p2, p3];
        expected.sort();
        assert_eq!(connected, expected);
    }

    #[test]
    fn node_ids_not_reused_after_removal() {
        let mut g: ContentGraph<Str, Label> = ContentGraph::new();
        let a = g.add_node_by_content_key("a".to_string(), Str("a".to_string()));
        g.remove_node(a);
        let b = g.add_node_by_content_key("b".to_string(), Str("b".to_string()));
        assert_ne!(a, b);
    }
}
