// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The typed dependency graph: six node kinds, six edge kinds, the filesystem-event invalidator,
//! and the filename trie used for "create above" predicates. See `SPEC_FULL.md` §3-4.2.1.

use std::path::{Path, PathBuf};

use fnv::FnvHashSet as HashSet;
use log::info;

use crate::content_graph::{ContentAddressable, ContentGraph};
use crate::error::{TrackerError, UnknownNodeId};
use crate::schema::{
    Edge, FileCreateInvalidation, InvalidateReason, Node, NodeId, NodeKind, StoredRequest,
};

impl ContentAddressable for Node {
    fn content_key(&self) -> String {
        Node::content_key(self)
    }
}

/// Filesystem event kinds the core reacts to. The watcher/snapshot facility that produces these
/// is an external collaborator (see `crate::collaborators`); the graph only ever consumes them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Event {
    pub path: PathBuf,
    pub kind: EventKind,
}

/// A reconstruction of one of a request's currently-declared invalidation edges, as returned by
/// `RequestGraph::invalidations_for` and snapshotted by `RunAPI::get_invalidations`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Invalidation {
    FileUpdate(PathBuf),
    FileDelete(PathBuf),
    FileCreateGlob(String),
    FileCreatePath(PathBuf),
    FileCreateAbove {
        file_name: String,
        above_file_path: PathBuf,
    },
    EnvChange(String),
    OptionChange(String),
}

/// The typed node/edge schema of §3, layered on top of [`ContentGraph`]. Maintains the
/// kind-partitioned side indices (`invalid_node_ids`, `incomplete_node_ids`,
/// `unpredictable_node_ids`, `glob_node_ids`, `env_node_ids`, `option_node_ids`) that the rest of
/// the tracker reads.
pub struct RequestGraph {
    graph: ContentGraph<Node, Edge>,
    invalid_node_ids: HashSet<NodeId>,
    incomplete_node_ids: HashSet<NodeId>,
    unpredictable_node_ids: HashSet<NodeId>,
    glob_node_ids: HashSet<NodeId>,
    env_node_ids: HashSet<NodeId>,
    option_node_ids: HashSet<NodeId>,
}

impl Default for RequestGraph {
    fn default() -> Self {
        RequestGraph {
            graph: ContentGraph::new(),
            invalid_node_ids: HashSet::default(),
            incomplete_node_ids: HashSet::default(),
            unpredictable_node_ids: HashSet::default(),
            glob_node_ids: HashSet::default(),
            env_node_ids: HashSet::default(),
            option_node_ids: HashSet::default(),
        }
    }
}

impl RequestGraph {
    pub fn new() -> RequestGraph {
        RequestGraph::default()
    }

    // -- Node access --------------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.get_node(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.graph.get_node_mut(id)
    }

    pub fn id_for_request(&self, request_id: &str) -> Option<NodeId> {
        self.graph.id_for_content_key(request_id)
    }

    pub fn invalid_node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.invalid_node_ids.iter().copied()
    }

    pub fn incomplete_node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.incomplete_node_ids.iter().copied()
    }

    pub fn unpredictable_node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.unpredictable_node_ids.iter().copied()
    }

    pub fn glob_node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.glob_node_ids.iter().copied()
    }

    pub fn env_node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.env_node_ids.iter().copied()
    }

    pub fn option_node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.option_node_ids.iter().copied()
    }

    /// Every node currently in the graph, for `Persistence` to walk when serializing. Not used by
    /// request-execution code, which only ever reaches nodes via content key or edge traversal.
    pub fn all_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.graph.all_nodes()
    }

    pub fn node_ids_connected_from(&self, id: NodeId, label: Edge) -> Vec<NodeId> {
        self.graph.node_ids_connected_from(id, label)
    }

    /// Inserts a node produced by deserialization directly, under the exact id it was persisted
    /// under (see `ContentGraph::insert_with_id`): `Persistence::load_request_graph` is
    /// reconstructing a graph it trusts to already be deduplicated, and ids must round-trip
    /// identically since a caller may be holding one across the persist boundary. Also threads the
    /// node into the matching kind-partitioned index.
    pub(crate) fn restore_node(&mut self, id: NodeId, node: Node) -> NodeId {
        let key = node.content_key();
        let kind = node.kind();
        self.graph.insert_with_id(id, key, node);
        match kind {
            NodeKind::Glob => {
                self.glob_node_ids.insert(id);
            }
            NodeKind::Env => {
                self.env_node_ids.insert(id);
            }
            NodeKind::Option => {
                self.option_node_ids.insert(id);
            }
            _ => {}
        }
        id
    }

    pub(crate) fn restore_edge(&mut self, from: NodeId, to: NodeId, label: Edge) {
        self.graph.add_edge(from, to, label);
    }

    /// The id `restore_node` would allocate a brand-new node under, i.e. `ContentGraph`'s current
    /// allocator position. `Persistence` serializes this so a restored graph resumes minting ids
    /// past the highest one the persisted graph used.
    pub(crate) fn next_raw_id(&self) -> u64 {
        self.graph.next_id_raw()
    }

    /// Resumes the id allocator at `next_id`; see `next_raw_id`.
    pub(crate) fn set_next_id(&mut self, next_id: u64) {
        self.graph.set_next_id(next_id);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore_side_indices(
        &mut self,
        invalid: impl Iterator<Item = NodeId>,
        incomplete: impl Iterator<Item = NodeId>,
        unpredictable: impl Iterator<Item = NodeId>,
        glob: impl Iterator<Item = NodeId>,
        env: impl Iterator<Item = NodeId>,
        option: impl Iterator<Item = NodeId>,
    ) {
        self.invalid_node_ids.extend(invalid);
        self.incomplete_node_ids.extend(incomplete);
        self.unpredictable_node_ids.extend(unpredictable);
        self.glob_node_ids.extend(glob);
        self.env_node_ids.extend(env);
        self.option_node_ids.extend(option);
    }

    pub fn is_invalid(&self, id: NodeId) -> bool {
        self.invalid_node_ids.contains(&id)
    }

    pub fn is_incomplete(&self, id: NodeId) -> bool {
        self.incomplete_node_ids.contains(&id)
    }

    pub fn has_invalid_requests(&self) -> bool {
        !self.invalid_node_ids.is_empty()
    }

    fn request(&self, id: NodeId) -> Result<&StoredRequest, TrackerError> {
        self.node(id)
            .ok_or(UnknownNodeId(id))?
            .as_request()
            .ok_or_else(|| TrackerError::invariant(format!("node {id:?} is not a Request")))
    }

    fn ensure_is_request(&self, id: NodeId) -> Result<(), TrackerError> {
        self.request(id).map(|_| ())
    }

    // -- Node management ------------------------------------------------------------------------

    /// Ensures a Request node exists for `stored.id`, returning its id. If it already existed,
    /// its payload is left untouched (the tracker updates it explicitly via `node_mut`).
    pub fn ensure_request(&mut self, stored: StoredRequest) -> NodeId {
        let key = stored.id.clone();
        self.graph
            .add_node_by_content_key(key, Node::Request(stored))
    }

    pub fn ensure_file(&mut self, path: &Path) -> NodeId {
        let node = Node::File(path.to_path_buf());
        self.graph.add_node_by_content_key(node.content_key(), node)
    }

    pub fn ensure_glob(&mut self, pattern: &str) -> NodeId {
        let node = Node::Glob(pattern.to_string());
        let id = self
            .graph
            .add_node_by_content_key(node.content_key(), node);
        self.glob_node_ids.insert(id);
        id
    }

    fn ensure_file_name(&mut self, segment: &str) -> NodeId {
        let node = Node::FileName(segment.to_string());
        self.graph.add_node_by_content_key(node.content_key(), node)
    }

    /// Ensures an Env node for `name`, refreshing its stored value to `value` even if the node
    /// already existed: the node records "the value this request last observed", which must track
    /// the most recent declaration so that a future `invalidate_env_nodes` compares against it
    /// rather than against a stale snapshot from a previous run.
    pub fn ensure_env(&mut self, name: &str, value: Option<String>) -> NodeId {
        let key = format!("env:{name}");
        let id = self.graph.add_node_by_content_key(
            key,
            Node::Env {
                name: name.to_string(),
                value: value.clone(),
            },
        );
        self.env_node_ids.insert(id);
        if let Some(Node::Env { value: stored, .. }) = self.graph.get_node_mut(id) {
            *stored = value;
        }
        id
    }

    /// Same refresh-on-redeclare behavior as `ensure_env`, for option hashes.
    pub fn ensure_option(&mut self, name: &str, hash: [u8; 32]) -> NodeId {
        let key = format!("option:{name}");
        let id = self.graph.add_node_by_content_key(
            key,
            Node::Option {
                name: name.to_string(),
                hash,
            },
        );
        self.option_node_ids.insert(id);
        if let Some(Node::Option { hash: stored, .. }) = self.graph.get_node_mut(id) {
            *stored = hash;
        }
        id
    }

    /// Removes `id` from the graph and every side index it might appear in.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let removed = self.graph.remove_node(id);
        self.invalid_node_ids.remove(&id);
        self.incomplete_node_ids.remove(&id);
        self.unpredictable_node_ids.remove(&id);
        self.glob_node_ids.remove(&id);
        self.env_node_ids.remove(&id);
        self.option_node_ids.remove(&id);
        removed
    }

    // -- Request lifecycle helpers used by RequestTracker ---------------------------------------

    pub fn mark_incomplete(&mut self, id: NodeId) {
        self.incomplete_node_ids.insert(id);
    }

    pub fn mark_complete(&mut self, id: NodeId) -> Result<(), TrackerError> {
        self.incomplete_node_ids.remove(&id);
        self.invalid_node_ids.remove(&id);
        let node = self.graph.get_node_mut(id).ok_or(UnknownNodeId(id))?;
        let req = node
            .as_request_mut()
            .ok_or_else(|| TrackerError::invariant(format!("node {id:?} is not a Request")))?;
        req.invalidate_reason = InvalidateReason::VALID;
        Ok(())
    }

    pub fn mark_incomplete_removed(&mut self, id: NodeId) {
        self.incomplete_node_ids.remove(&id);
    }

    pub fn clear_invalid_flag(&mut self, id: NodeId) {
        self.invalid_node_ids.remove(&id);
    }

    /// Replaces `request_id`'s outgoing `subrequest` edges with exactly `children`.
    pub fn replace_subrequests(&mut self, request_id: NodeId, children: Vec<NodeId>) {
        self.graph
            .replace_node_ids_connected_from(request_id, children, Edge::Subrequest);
    }

    /// `request_id`'s current outgoing `subrequest` edges, in unspecified order.
    pub fn subrequests_of(&self, request_id: NodeId) -> Vec<NodeId> {
        self.graph.node_ids_connected_from(request_id, Edge::Subrequest)
    }

    // -- Invalidation primitives (§4.2) ----------------------------------------------------------

    /// OR-combines `reason` into the node's `invalidate_reason`, marks it invalid, and invalidates
    /// every ancestor reachable via reversed `subrequest` edges with the same reason (invariant 5).
    pub fn invalidate_node(&mut self, id: NodeId, reason: InvalidateReason) -> Result<(), TrackerError> {
        let mut stack = vec![id];
        let mut seen: HashSet<NodeId> = HashSet::default();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            {
                let node = self.graph.get_node_mut(current).ok_or(UnknownNodeId(current))?;
                let req = node.as_request_mut().ok_or_else(|| {
                    TrackerError::invariant(format!("node {current:?} is not a Request"))
                })?;
                req.invalidate_reason |= reason;
                crate::test_trace_log!("invalidated {:?} with reason {:?}", current, reason);
            }
            self.invalid_node_ids.insert(current);
            stack.extend(self.graph.node_ids_connected_to(current, Edge::Subrequest));
        }
        Ok(())
    }

    pub fn invalidate_unpredictable_nodes(&mut self) -> Result<(), TrackerError> {
        let ids: Vec<NodeId> = self.unpredictable_node_ids.iter().copied().collect();
        for id in ids {
            self.invalidate_node(id, InvalidateReason::STARTUP)?;
        }
        Ok(())
    }

    /// For each Env node whose stored value differs from `env.get(name)`, invalidates its
    /// `invalidated_by_update` predecessors with `ENV_CHANGE`.
    pub fn invalidate_env_nodes(
        &mut self,
        env: &std::collections::HashMap<String, String>,
    ) -> Result<(), TrackerError> {
        let ids: Vec<NodeId> = self.env_node_ids.iter().copied().collect();
        for id in ids {
            let Some(Node::Env { name, value }) = self.graph.get_node(id) else {
                continue;
            };
            let current = env.get(name).cloned();
            if current != *value {
                let predecessors = self.graph.node_ids_connected_to(id, Edge::InvalidatedByUpdate);
                for pred in predecessors {
                    self.invalidate_node(pred, InvalidateReason::ENV_CHANGE)?;
                }
            }
        }
        Ok(())
    }

    /// Symmetric with `invalidate_env_nodes`, comparing option hashes; reason `OPTION_CHANGE`.
    pub fn invalidate_option_nodes(
        &mut self,
        options: &std::collections::HashMap<String, [u8; 32]>,
    ) -> Result<(), TrackerError> {
        let ids: Vec<NodeId> = self.option_node_ids.iter().copied().collect();
        for id in ids {
            let Some(Node::Option { name, hash }) = self.graph.get_node(id) else {
                continue;
            };
            let current = options.get(name).copied();
            if current != Some(*hash) {
                let predecessors = self.graph.node_ids_connected_to(id, Edge::InvalidatedByUpdate);
                for pred in predecessors {
                    self.invalidate_node(pred, InvalidateReason::OPTION_CHANGE)?;
                }
            }
        }
        Ok(())
    }

    /// Removes `request_id` from `unpredictable_node_ids` and drops all of its outgoing
    /// `invalidated_by_{update,delete,create}` edges, so the body can rebuild them from scratch.
    /// Does not touch `dirname`/`invalidated_by_create_above` trie edges: those are shared
    /// structure owned by the trie, not by any single request.
    pub fn clear_invalidations(&mut self, request_id: NodeId) -> Result<(), TrackerError> {
        self.ensure_is_request(request_id)?;
        self.unpredictable_node_ids.remove(&request_id);
        for label in [
            Edge::InvalidatedByUpdate,
            Edge::InvalidatedByDelete,
            Edge::InvalidatedByCreate,
        ] {
            let targets = self.graph.node_ids_connected_from(request_id, label);
            for target in targets {
                self.graph.remove_edge(request_id, target, label);
            }
        }
        Ok(())
    }

    // -- Dependency declaration primitives (invoked via RunAPI) ----------------------------------

    pub fn invalidate_on_file_update(&mut self, request_id: NodeId, path: &Path) -> Result<(), TrackerError> {
        self.ensure_is_request(request_id)?;
        let file_id = self.ensure_file(path);
        self.graph.add_edge(request_id, file_id, Edge::InvalidatedByUpdate);
        Ok(())
    }

    pub fn invalidate_on_file_delete(&mut self, request_id: NodeId, path: &Path) -> Result<(), TrackerError> {
        self.ensure_is_request(request_id)?;
        let file_id = self.ensure_file(path);
        self.graph.add_edge(request_id, file_id, Edge::InvalidatedByDelete);
        Ok(())
    }

    pub fn invalidate_on_file_create(
        &mut self,
        request_id: NodeId,
        spec: FileCreateInvalidation,
    ) -> Result<(), TrackerError> {
        self.ensure_is_request(request_id)?;
        let target = match spec {
            FileCreateInvalidation::Glob(pattern) => {
                if glob::Pattern::new(&pattern).is_err() {
                    return Err(TrackerError::invalid_invalidation(format!(
                        "not a valid glob pattern: {pattern}"
                    )));
                }
                self.ensure_glob(&pattern)
            }
            FileCreateInvalidation::FilePath(path) => self.ensure_file(&path),
            FileCreateInvalidation::FileNameAbove {
                file_name,
                above_file_path,
            } => {
                if file_name.is_empty() {
                    return Err(TrackerError::invalid_invalidation(
                        "fileName must not be empty",
                    ));
                }
                self.ensure_filename_trie(&file_name, &above_file_path)
            }
        };
        self.graph.add_edge(request_id, target, Edge::InvalidatedByCreate);
        Ok(())
    }

    pub fn invalidate_on_startup(&mut self, request_id: NodeId) -> Result<(), TrackerError> {
        self.ensure_is_request(request_id)?;
        self.unpredictable_node_ids.insert(request_id);
        Ok(())
    }

    pub fn invalidate_on_env_change(
        &mut self,
        request_id: NodeId,
        name: &str,
        current_value: Option<String>,
    ) -> Result<(), TrackerError> {
        self.ensure_is_request(request_id)?;
        let env_id = self.ensure_env(name, current_value);
        self.graph.add_edge(request_id, env_id, Edge::InvalidatedByUpdate);
        Ok(())
    }

    pub fn invalidate_on_option_change(
        &mut self,
        request_id: NodeId,
        name: &str,
        current_hash: [u8; 32],
    ) -> Result<(), TrackerError> {
        self.ensure_is_request(request_id)?;
        let option_id = self.ensure_option(name, current_hash);
        self.graph.add_edge(request_id, option_id, Edge::InvalidatedByUpdate);
        Ok(())
    }

    /// Reconstructs the invalidations currently declared by `request_id`, by inspecting its
    /// outgoing `invalidated_by_{update,delete,create}` edges. Used both by the testable law in
    /// `SPEC_FULL.md` §8 and as the source `RunAPI::get_invalidations` snapshots from.
    pub fn invalidations_for(&self, request_id: NodeId) -> Vec<Invalidation> {
        let mut out = Vec::new();
        for target in self
            .graph
            .node_ids_connected_from(request_id, Edge::InvalidatedByUpdate)
        {
            match self.graph.get_node(target) {
                Some(Node::File(path)) => out.push(Invalidation::FileUpdate(path.clone())),
                Some(Node::Env { name, .. }) => out.push(Invalidation::EnvChange(name.clone())),
                Some(Node::Option { name, .. }) => out.push(Invalidation::OptionChange(name.clone())),
                _ => {}
            }
        }
        for target in self
            .graph
            .node_ids_connected_from(request_id, Edge::InvalidatedByDelete)
        {
            if let Some(Node::File(path)) = self.graph.get_node(target) {
                out.push(Invalidation::FileDelete(path.clone()));
            }
        }
        for target in self
            .graph
            .node_ids_connected_from(request_id, Edge::InvalidatedByCreate)
        {
            match self.graph.get_node(target) {
                Some(Node::Glob(pattern)) => out.push(Invalidation::FileCreateGlob(pattern.clone())),
                Some(Node::File(path)) => {
                    let chains = self.reconstruct_file_name_chains(target);
                    if chains.is_empty() {
                        out.push(Invalidation::FileCreatePath(path.clone()));
                    } else {
                        for file_name in chains {
                            out.push(Invalidation::FileCreateAbove {
                                file_name,
                                above_file_path: path.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Best-effort reconstruction of the `fileName` string(s) registered against File node `p_id`
    /// via the filename trie, by following its outgoing `invalidated_by_create_above` edges (the
    /// "start of chain" markers) forward through `dirname` edges.
    fn reconstruct_file_name_chains(&self, p_id: NodeId) -> Vec<String> {
        let mut chains = Vec::new();
        for first in self
            .graph
            .node_ids_connected_from(p_id, Edge::InvalidatedByCreateAbove)
        {
            let mut segments = Vec::new();
            let mut current = first;
            loop {
                match self.graph.get_node(current) {
                    Some(Node::FileName(segment)) => segments.push(segment.clone()),
                    _ => break,
                }
                let mut parents = self.graph.node_ids_connected_from(current, Edge::Dirname);
                match parents.pop() {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
            segments.reverse();
            chains.push(segments.join("/"));
        }
        chains
    }

    // -- Filename trie (§4.2.1) -------------------------------------------------------------------

    /// Builds (or reuses) the filename-trie chain for `file_name`, and returns the File node id
    /// for `above_file_path`. Steps 1-5 of §4.2.1; step 6 (the `request -> P` edge) is added by
    /// the caller.
    fn ensure_filename_trie(&mut self, file_name: &str, above_file_path: &Path) -> NodeId {
        let reversed: Vec<&str> = file_name.split('/').rev().collect();
        let segment_ids: Vec<NodeId> = reversed.iter().map(|seg| self.ensure_file_name(seg)).collect();
        for pair in segment_ids.windows(2) {
            self.graph.add_edge(pair[0], pair[1], Edge::Dirname);
        }

        let p = self.ensure_file(above_file_path);
        let first = segment_ids[0];
        let last = *segment_ids.last().expect("file_name is non-empty");
        self.graph.add_edge(p, first, Edge::InvalidatedByCreateAbove);
        self.graph.add_edge(last, p, Edge::InvalidatedByCreateAbove);
        p
    }

    // -- Filesystem-event handling (§4.2) ---------------------------------------------------------

    /// Processes `events` in order. Returns `true` iff at least one invalidation happened and the
    /// graph now has invalid requests.
    pub fn respond_to_fs_events(&mut self, events: &[Event]) -> Result<bool, TrackerError> {
        let mut changed = false;
        for event in events {
            match event.kind {
                EventKind::Update => {
                    changed |= self.handle_update(&event.path)?;
                }
                EventKind::Create => {
                    // Platform quirk: some watchers report an update to a known path as a create.
                    if self.graph.has_content_key(&path_content_key(&event.path)) {
                        changed |= self.handle_update(&event.path)?;
                    }
                    changed |= self.handle_create(&event.path)?;
                }
                EventKind::Delete => {
                    changed |= self.handle_delete(&event.path)?;
                }
            }
        }
        let has_invalid = self.has_invalid_requests();
        if changed && has_invalid {
            info!("filesystem events invalidated requests");
        }
        Ok(changed && has_invalid)
    }

    fn handle_update(&mut self, path: &Path) -> Result<bool, TrackerError> {
        let Some(id) = self.graph.id_for_content_key(&path_content_key(path)) else {
            return Ok(false);
        };
        let predecessors = self.graph.node_ids_connected_to(id, Edge::InvalidatedByUpdate);
        let mut changed = false;
        for pred in predecessors {
            self.invalidate_node(pred, InvalidateReason::FILE_UPDATE)?;
            changed = true;
        }
        Ok(changed)
    }

    fn handle_delete(&mut self, path: &Path) -> Result<bool, TrackerError> {
        let Some(id) = self.graph.id_for_content_key(&path_content_key(path)) else {
            return Ok(false);
        };
        let predecessors = self.graph.node_ids_connected_to(id, Edge::InvalidatedByDelete);
        let mut changed = false;
        for pred in predecessors {
            self.invalidate_node(pred, InvalidateReason::FILE_DELETE)?;
            changed = true;
        }
        Ok(changed)
    }

    fn handle_create(&mut self, path: &Path) -> Result<bool, TrackerError> {
        let mut changed = self.match_globs(path)?;
        if let Some(basename) = path.file_name().and_then(|s| s.to_str()) {
            let key = format!("file_name:{basename}");
            if let Some(start_id) = self.graph.id_for_content_key(&key) {
                changed |= self.walk_filename_trie(start_id, path, 0)?;
            }
        }
        Ok(changed)
    }

    fn match_globs(&mut self, path: &Path) -> Result<bool, TrackerError> {
        let glob_ids: Vec<NodeId> = self.glob_node_ids.iter().copied().collect();
        let path_str = path.to_string_lossy().into_owned();
        let mut changed = false;
        for id in glob_ids {
            let Some(Node::Glob(pattern)) = self.graph.get_node(id) else {
                continue;
            };
            let Ok(compiled) = glob::Pattern::new(pattern) else {
                continue;
            };
            if !compiled.matches(&path_str) {
                continue;
            }
            let predecessors = self.graph.node_ids_connected_to(id, Edge::InvalidatedByCreate);
            for pred in predecessors {
                self.invalidate_node(pred, InvalidateReason::FILE_CREATE)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Walks upward from `node_id` (a FileName node) via `dirname` edges. At each level, any
    /// outgoing `invalidated_by_create_above` edge names a candidate `P`; if `P`'s directory is an
    /// ancestor-or-equal of the directory formed by stripping `level + 1` trailing components off
    /// `event_path`, the requests attached to `P` via `invalidated_by_create` are invalidated. See
    /// `DESIGN.md` for why the ancestor check is anchored at the terminal segment of each chain
    /// rather than re-checked at every level for every candidate.
    fn walk_filename_trie(
        &mut self,
        node_id: NodeId,
        event_path: &Path,
        level: usize,
    ) -> Result<bool, TrackerError> {
        let mut changed = false;
        let remaining_dir = strip_trailing_components(event_path, level + 1);
        for p_id in self
            .graph
            .node_ids_connected_from(node_id, Edge::InvalidatedByCreateAbove)
        {
            let Some(Node::File(p_path)) = self.graph.get_node(p_id) else {
                continue;
            };
            let Some(p_parent) = p_path.parent() else {
                continue;
            };
            let Some(remaining) = remaining_dir.as_deref() else {
                continue;
            };
            if !is_ancestor_or_equal(remaining, p_parent) {
                continue;
            }
            let requesters = self.graph.node_ids_connected_to(p_id, Edge::InvalidatedByCreate);
            for req in requesters {
                self.invalidate_node(req, InvalidateReason::FILE_CREATE)?;
                changed = true;
            }
        }
        let parents = self.graph.node_ids_connected_from(node_id, Edge::Dirname);
        for parent in parents {
            changed |= self.walk_filename_trie(parent, event_path, level + 1)?;
        }
        Ok(changed)
    }

    pub fn node_kind(&self, id: NodeId) -> Option<NodeKind> {
        self.node(id).map(|n| n.kind())
    }

    // -- Maintenance (§9) ---------------------------------------------------------------------

    /// Removes every File/Glob/FileName/Env/Option node with no incident edge at all. Requests
    /// drop their edges to these auxiliary nodes via `clear_invalidations`, but the auxiliary
    /// nodes themselves are only ever reclaimed by calling this; it is never invoked implicitly.
    /// Returns the number of nodes removed.
    pub fn gc_auxiliary_nodes(&mut self) -> usize {
        let candidates: Vec<NodeId> = self
            .graph
            .all_nodes()
            .filter(|(_, node)| node.kind() != NodeKind::Request)
            .map(|(id, _)| id)
            .filter(|&id| !self.graph.has_any_incident_edge(id))
            .collect();
        for &id in &candidates {
            self.remove_node(id);
        }
        candidates.len()
    }
}

fn path_content_key(path: &Path) -> String {
    path.display().to_string()
}

/// Removes `n` trailing path components, returning `None` if the path is too shallow.
fn strip_trailing_components(path: &Path, n: usize) -> Option<PathBuf> {
    let mut result = path.to_path_buf();
    for _ in 0..n {
        if !result.pop() {
            return None;
        }
    }
    Some(result)
}

/// True if `ancestor` is `descendant`, or a prefix of it in the component sense (not merely a
/// string prefix: `/proj` must not be considered an ancestor of `/projects`).
fn is_ancestor_or_equal(ancestor: &Path, descendant: &Path) -> bool {
    if ancestor == descendant {
        return true;
    }
    let mut ancestor_components = ancestor.components();
    let mut descendant_components = descendant.components();
    loop {
        match ancestor_components.next() {
            None => return true,
            Some(a) => match descendant_components.next() {
                Some(d) if a == d => continue,
                _ => return false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_request(g: &mut RequestGraph, id: &str) -> NodeId {
        g.ensure_request(StoredRequest::new(id, "test"))
    }

    #[test]
    fn clear_then_invalidate_on_file_update_law() {
        let mut g = RequestGraph::new();
        let r = new_request(&mut g, "A");
        g.clear_invalidations(r).unwrap();
        g.invalidate_on_file_update(r, Path::new("/x.txt")).unwrap();

        let invalidations = g.invalidations_for(r);
        assert_eq!(
            invalidations,
            vec![Invalidation::FileUpdate(PathBuf::from("/x.txt"))]
        );
    }

    #[test]
    fn file_update_event_invalidates_dependent_request() {
        let mut g = RequestGraph::new();
        let r = new_request(&mut g, "A");
        g.invalidate_on_file_update(r, Path::new("/x.txt")).unwrap();

        let changed = g
            .respond_to_fs_events(&[Event {
                path: PathBuf::from("/x.txt"),
                kind: EventKind::Update,
            }])
            .unwrap();

        assert!(changed);
        assert!(g.is_invalid(r));
        assert!(g.request(r).unwrap().invalidate_reason.contains(InvalidateReason::FILE_UPDATE));
    }

    #[test]
    fn file_delete_event_invalidates_only_delete_dependents() {
        let mut g = RequestGraph::new();
        let r = new_request(&mut g, "A");
        g.invalidate_on_file_delete(r, Path::new("/x.txt")).unwrap();

        let changed_on_update = g
            .respond_to_fs_events(&[Event {
                path: PathBuf::from("/x.txt"),
                kind: EventKind::Update,
            }])
            .unwrap();
        assert!(!changed_on_update);
        assert!(!g.is_invalid(r));

        let changed_on_delete = g
            .respond_to_fs_events(&[Event {
                path: PathBuf::from("/x.txt"),
                kind: EventKind::Delete,
            }])
            .unwrap();
        assert!(changed_on_delete);
        assert!(g.is_invalid(r));
    }

    #[test]
    fn filename_above_invalidates_only_within_subtree() {
        let mut g = RequestGraph::new();
        let r = new_request(&mut g, "A");
        g.invalidate_on_file_create(
            r,
            FileCreateInvalidation::FileNameAbove {
                file_name: "node_modules/foo".to_string(),
                above_file_path: PathBuf::from("/proj/src/index.js"),
            },
        )
        .unwrap();

        let inside = g
            .respond_to_fs_events(&[Event {
                path: PathBuf::from("/proj/node_modules/foo"),
                kind: EventKind::Create,
            }])
            .unwrap();
        assert!(inside);
        assert!(g.is_invalid(r));

        // Reset and check the negative case in isolation.
        let mut g = RequestGraph::new();
        let r = new_request(&mut g, "A");
        g.invalidate_on_file_create(
            r,
            FileCreateInvalidation::FileNameAbove {
                file_name: "node_modules/foo".to_string(),
                above_file_path: PathBuf::from("/proj/src/index.js"),
            },
        )
        .unwrap();
        let outside = g
            .respond_to_fs_events(&[Event {
                path: PathBuf::from("/other/node_modules/foo"),
                kind: EventKind::Create,
            }])
            .unwrap();
        assert!(!outside);
        assert!(!g.is_invalid(r));
    }

    #[test]
    fn shared_filename_segment_is_deduplicated() {
        let mut g = RequestGraph::new();
        let r1 = new_request(&mut g, "A");
        let r2 = new_request(&mut g, "B");
        g.invalidate_on_file_create(
            r1,
            FileCreateInvalidation::FileNameAbove {
                file_name: "node_modules/foo".to_string(),
                above_file_path: PathBuf::from("/proj/src/a.js"),
            },
        )
        .unwrap();
        g.invalidate_on_file_create(
            r2,
            FileCreateInvalidation::FileNameAbove {
                file_name: "node_modules/bar".to_string(),
                above_file_path: PathBuf::from("/proj/src/b.js"),
            },
        )
        .unwrap();

        // Both chains share the single "node_modules" segment node.
        let node_modules_id = g
            .graph
            .id_for_content_key("file_name:node_modules")
            .expect("shared segment node exists");
        let foo_id = g
            .graph
            .id_for_content_key("file_name:foo")
            .expect("foo segment exists");
        let bar_id = g
            .graph
            .id_for_content_key("file_name:bar")
            .expect("bar segment exists");
        assert_ne!(foo_id, bar_id);
        assert!(g.graph.has_edge(foo_id, node_modules_id, Edge::Dirname));
        assert!(g.graph.has_edge(bar_id, node_modules_id, Edge::Dirname));
    }

    #[test]
    fn env_change_invalidates_dependents() {
        let mut g = RequestGraph::new();
        let r = new_request(&mut g, "A");
        g.invalidate_on_env_change(r, "FOO", Some("1".to_string()))
            .unwrap();

        let mut env = std::collections::HashMap::new();
        env.insert("FOO".to_string(), "1".to_string());
        g.invalidate_env_nodes(&env).unwrap();
        assert!(!g.is_invalid(r));

        env.insert("FOO".to_string(), "2".to_string());
        g.invalidate_env_nodes(&env).unwrap();
        assert!(g.is_invalid(r));
        assert!(g
            .request(r)
            .unwrap()
            .invalidate_reason
            .contains(InvalidateReason::ENV_CHANGE));
    }

    #[test]
    fn invalidate_node_propagates_to_subrequest_ancestors() {
        let mut g = RequestGraph::new();
        let parent = new_request(&mut g, "parent");
        let child = new_request(&mut g, "child");
        g.graph.add_edge(parent, child, Edge::Subrequest);

        g.invalidate_node(child, InvalidateReason::ERROR).unwrap();

        assert!(g.is_invalid(child));
        assert!(g.is_invalid(parent));
    }

    #[test]
    fn clear_invalidations_preserves_shared_trie_edges() {
        let mut g = RequestGraph::new();
        let r1 = new_request(&mut g, "A");
        let r2 = new_request(&mut g, "B");
        g.invalidate_on_file_create(
            r1,
            FileCreateInvalidation::FileNameAbove {
                file_name: "node_modules/foo".to_string(),
                above_file_path: PathBuf::from("/proj/src/a.js"),
            },
        )
        .unwrap();
        g.invalidate_on_file_create(
            r2,
            FileCreateInvalidation::FileNameAbove {
                file_name: "node_modules/bar".to_string(),
                above_file_path: PathBuf::from("/proj/src/b.js"),
            },
        )
        .unwrap();

        g.clear_invalidations(r1).unwrap();

        // r1's own invalidated_by_create edge is gone...
        assert!(g.invalidations_for(r1).is_empty());
        // ...but r2's trie registration (sharing the "node_modules" segment) still works.
        let changed = g
            .respond_to_fs_events(&[Event {
                path: PathBuf::from("/proj/node_modules/bar"),
                kind: EventKind::Create,
            }])
            .unwrap();
        assert!(changed);
        assert!(g.is_invalid(r2));
        assert!(!g.is_invalid(r1));
    }

    #[test]
    fn gc_removes_only_edgeless_auxiliary_nodes() {
        let mut g = RequestGraph::new();
        let r1 = new_request(&mut g, "A");
        let r2 = new_request(&mut g, "B");
        g.invalidate_on_file_update(r1, Path::new("/x.txt")).unwrap();
        // /y.txt is registered then orphaned by clearing r2's invalidations.
        g.invalidate_on_file_update(r2, Path::new("/y.txt")).unwrap();
        g.clear_invalidations(r2).unwrap();

        let removed = g.gc_auxiliary_nodes();
        assert_eq!(removed, 1);
        assert!(g.graph.id_for_content_key("/x.txt").is_some());
        assert!(g.graph.id_for_content_key("/y.txt").is_none());
        // Request nodes are never collected even though r2 now has no invalidation edges.
        assert!(g.node(r1).is_some());
        assert!(g.node(r2).is_some());
    }
}
