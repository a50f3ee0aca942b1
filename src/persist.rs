// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Serializing the graph and a filesystem snapshot, then reconciling events accumulated while
//! the process was not running. See `SPEC_FULL.md` §4.5.
//!
//! Request results are type-erased (`Arc<dyn Any + Send + Sync>`), so they can't be serialized
//! generically. The convention this module relies on: a result is only ever evictable to the
//! object cache if the body stored it as pre-serialized bytes (`Arc<Vec<u8>>`) alongside a
//! `result_cache_key` — see `RequestTracker::get_request_result`'s matching bytes-fallback path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::collaborators::WatcherOptions;
use crate::error::TrackerError;
use crate::request_graph::RequestGraph;
use crate::schema::{Edge, InvalidateReason, Node, NodeId, StoredRequest};
use crate::tracker::RequestTracker;

/// Bumped whenever the on-disk shape of `PersistedGraph` changes in a way that isn't backward
/// compatible. Schema migration of the persisted graph is an explicit non-goal: a mismatch here
/// just misses cache and starts fresh, the same as a cold cache.
const FORMAT_VERSION: u32 = 1;

const ALL_EDGE_LABELS: [Edge; 6] = [
    Edge::Subrequest,
    Edge::InvalidatedByUpdate,
    Edge::InvalidatedByDelete,
    Edge::InvalidatedByCreate,
    Edge::InvalidatedByCreateAbove,
    Edge::Dirname,
];

#[derive(Serialize, Deserialize)]
enum PersistedNode {
    File(PathBuf),
    Glob(String),
    FileName(String),
    Env {
        name: String,
        value: Option<String>,
    },
    Option {
        name: String,
        hash: [u8; 32],
    },
    Request {
        id: String,
        request_type: String,
        result_cache_key: Option<String>,
        invalidate_reason: InvalidateReason,
    },
}

#[derive(Serialize, Deserialize)]
struct PersistedGraph {
    format_version: u32,
    /// The id allocator's position at serialization time, so restoration resumes minting ids past
    /// the highest one used here rather than colliding with a node it's about to restore.
    next_id: u64,
    nodes: Vec<(u64, PersistedNode)>,
    edges: Vec<(u64, u64, Edge)>,
    invalid_node_ids: Vec<u64>,
    incomplete_node_ids: Vec<u64>,
    unpredictable_node_ids: Vec<u64>,
    glob_node_ids: Vec<u64>,
    env_node_ids: Vec<u64>,
    option_node_ids: Vec<u64>,
}

/// Drives serialization/restoration of a `RequestTracker`'s graph against a `Cache` and an
/// `InputFs`. Holds the identity (`engine_version`, `entries`) that forms the cache key: a
/// version mismatch invalidates the whole cache implicitly, since the version is baked into the
/// key rather than checked after the fact.
pub struct Persistence {
    tracker: Arc<RequestTracker>,
    project_root: PathBuf,
    engine_version: String,
    entries: Vec<String>,
    caching_enabled: bool,
}

impl Persistence {
    pub fn new(
        tracker: Arc<RequestTracker>,
        project_root: PathBuf,
        engine_version: impl Into<String>,
        entries: Vec<String>,
        caching_enabled: bool,
    ) -> Persistence {
        Persistence {
            tracker,
            project_root,
            engine_version: engine_version.into(),
            entries,
            caching_enabled,
        }
    }

    fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.engine_version.as_bytes());
        for entry in &self.entries {
            hasher.update(b"\0");
            hasher.update(entry.as_bytes());
        }
        hex(&hasher.finalize())
    }

    fn graph_cache_key(&self) -> String {
        format!("{}:requestGraph", self.cache_key())
    }

    fn snapshot_path(&self) -> PathBuf {
        self.tracker
            .cache()
            .cache_path(&format!("{}:snapshot", self.cache_key()), "snapshot")
    }

    fn watcher_options(&self) -> WatcherOptions {
        WatcherOptions {
            ignore: vec![
                self.tracker.cache().cache_path("", ""),
                self.project_root.join(".git"),
                self.project_root.join(".hg"),
            ],
        }
    }

    /// Evicts cacheable inline results, writes the serialized graph, then asks the filesystem
    /// collaborator for a fresh snapshot. A no-op if caching is disabled.
    pub async fn write_to_cache(&self) -> Result<(), TrackerError> {
        if !self.caching_enabled {
            return Ok(());
        }

        let (persisted, evictions) = self.tracker.with_graph(|g| {
            let mut evictions = Vec::new();
            let ids: Vec<NodeId> = g.all_nodes().map(|(id, _)| id).collect();
            for id in ids {
                let Some(node) = g.node_mut(id) else { continue };
                let Some(req) = node.as_request_mut() else { continue };
                if let Some(cache_key) = req.result_cache_key.clone() {
                    if let Some(result) = req.result.take() {
                        match result.downcast::<Vec<u8>>() {
                            Ok(bytes) => evictions.push((cache_key, (*bytes).clone())),
                            Err(not_bytes) => {
                                // Not yet serialized by the body; keep it inline rather than drop
                                // it silently, and skip eviction this round.
                                req.result = Some(not_bytes);
                            }
                        }
                    }
                }
            }
            (persisted_graph_from(g), evictions)
        });

        for (cache_key, bytes) in evictions {
            self.tracker
                .cache()
                .set(&cache_key, bytes)
                .await
                .map_err(|e| TrackerError::invariant(format!("cache write failed: {e}")))?;
        }

        let bytes = bincode::serialize(&persisted)
            .map_err(|e| TrackerError::invariant(format!("failed to serialize graph: {e}")))?;
        self.tracker
            .cache()
            .set(&self.graph_cache_key(), bytes)
            .await
            .map_err(|e| TrackerError::invariant(format!("cache write failed: {e}")))?;

        self.tracker
            .fs()
            .write_snapshot(&self.project_root, &self.snapshot_path(), &self.watcher_options())
            .await
            .map_err(|e| TrackerError::invariant(format!("snapshot write failed: {e}")))?;

        info!("wrote request graph and watcher snapshot to cache");
        Ok(())
    }

    /// Restores the graph from cache, reconciling unpredictable/env/option nodes against current
    /// state and folding in filesystem events accumulated since the snapshot. Falls back to a
    /// fresh, empty graph if caching is disabled, nothing is cached yet, or the cached blob fails
    /// to deserialize (a version bump or corruption both look the same here: miss and rebuild).
    pub async fn load_request_graph(
        &self,
        current_env: &HashMap<String, String>,
        current_options: &HashMap<String, [u8; 32]>,
    ) -> Result<RequestGraph, TrackerError> {
        if !self.caching_enabled {
            return Ok(RequestGraph::new());
        }

        let bytes = match self.tracker.cache().get(&self.graph_cache_key()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(RequestGraph::new()),
            Err(e) => {
                warn!("failed to read cached request graph: {e}");
                return Ok(RequestGraph::new());
            }
        };

        let persisted: PersistedGraph = match bincode::deserialize(&bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to deserialize cached request graph: {e}");
                return Ok(RequestGraph::new());
            }
        };
        if persisted.format_version != FORMAT_VERSION {
            warn!(
                "cached request graph format version {} != {FORMAT_VERSION}, discarding",
                persisted.format_version
            );
            return Ok(RequestGraph::new());
        }

        let mut graph = graph_from_persisted(persisted);

        graph.invalidate_unpredictable_nodes()?;
        graph.invalidate_env_nodes(current_env)?;
        graph.invalidate_option_nodes(current_options)?;

        let events = self
            .tracker
            .fs()
            .events_since(&self.project_root, &self.snapshot_path(), &self.watcher_options())
            .await
            .map_err(|e| TrackerError::invariant(format!("failed to read events since snapshot: {e}")))?;
        graph.respond_to_fs_events(&events)?;

        Ok(graph)
    }
}

fn persisted_graph_from(g: &RequestGraph) -> PersistedGraph {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for (id, node) in g.all_nodes() {
        nodes.push((id.raw(), to_persisted_node(node)));
        for label in ALL_EDGE_LABELS {
            for target in g.node_ids_connected_from(id, label) {
                edges.push((id.raw(), target.raw(), label));
            }
        }
    }

    PersistedGraph {
        format_version: FORMAT_VERSION,
        next_id: g.next_raw_id(),
        nodes,
        edges,
        invalid_node_ids: g.invalid_node_ids().map(NodeId::raw).collect(),
        incomplete_node_ids: g.incomplete_node_ids().map(NodeId::raw).collect(),
        unpredictable_node_ids: g.unpredictable_node_ids().map(NodeId::raw).collect(),
        glob_node_ids: g.glob_node_ids().map(NodeId::raw).collect(),
        env_node_ids: g.env_node_ids().map(NodeId::raw).collect(),
        option_node_ids: g.option_node_ids().map(NodeId::raw).collect(),
    }
}

fn to_persisted_node(node: &Node) -> PersistedNode {
    match node {
        Node::File(path) => PersistedNode::File(path.clone()),
        Node::Glob(pattern) => PersistedNode::Glob(pattern.clone()),
        Node::FileName(segment) => PersistedNode::FileName(segment.clone()),
        Node::Env { name, value } => PersistedNode::Env {
            name: name.clone(),
            value: value.clone(),
        },
        Node::Option { name, hash } => PersistedNode::Option {
            name: name.clone(),
            hash: *hash,
        },
        Node::Request(req) => PersistedNode::Request {
            id: req.id.clone(),
            request_type: req.request_type.clone(),
            result_cache_key: req.result_cache_key.clone(),
            invalidate_reason: req.invalidate_reason,
        },
    }
}

fn graph_from_persisted(persisted: PersistedGraph) -> RequestGraph {
    let mut graph = RequestGraph::new();

    for (raw_id, node) in persisted.nodes {
        graph.restore_node(NodeId::from_raw(raw_id), from_persisted_node(node));
    }
    for (from_raw, to_raw, label) in persisted.edges {
        graph.restore_edge(NodeId::from_raw(from_raw), NodeId::from_raw(to_raw), label);
    }
    graph.restore_side_indices(
        persisted.invalid_node_ids.into_iter().map(NodeId::from_raw),
        persisted.incomplete_node_ids.into_iter().map(NodeId::from_raw),
        persisted.unpredictable_node_ids.into_iter().map(NodeId::from_raw),
        persisted.glob_node_ids.into_iter().map(NodeId::from_raw),
        persisted.env_node_ids.into_iter().map(NodeId::from_raw),
        persisted.option_node_ids.into_iter().map(NodeId::from_raw),
    );
    // Ids are restored verbatim above; resume the allocator past the highest one the persisted
    // graph used so a newly declared node during this run can never collide with one just restored.
    graph.set_next_id(persisted.next_id);
    graph
}

fn from_persisted_node(node: PersistedNode) -> Node {
    match node {
        PersistedNode::File(path) => Node::File(path),
        PersistedNode::Glob(pattern) => Node::Glob(pattern),
        PersistedNode::FileName(segment) => Node::FileName(segment),
        PersistedNode::Env { name, value } => Node::Env { name, value },
        PersistedNode::Option { name, hash } => Node::Option { name, hash },
        PersistedNode::Request {
            id,
            request_type,
            result_cache_key,
            invalidate_reason,
        } => {
            let mut stored = StoredRequest::new(id, request_type);
            stored.result_cache_key = result_cache_key;
            stored.invalidate_reason = invalidate_reason;
            Node::Request(stored)
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Cache, InMemoryCache, InMemoryFs, NoopWorkerPool};
    use crate::request_graph::{Event, EventKind};
    use crate::schema::FileCreateInvalidation;

    fn test_tracker() -> Arc<RequestTracker> {
        let _ = env_logger::try_init();
        Arc::new(RequestTracker::new(
            Arc::new(InMemoryCache::new(PathBuf::from("/tmp/cache"))),
            Arc::new(InMemoryFs::new()),
            Arc::new(NoopWorkerPool),
            HashMap::new(),
        ))
    }

    #[test]
    fn cache_paths_resolve_under_the_configured_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InMemoryCache::new(dir.path().to_path_buf());
        let path = cache.cache_path("k", "bin");
        assert_eq!(path, dir.path().join("k.bin"));
    }

    #[tokio::test]
    async fn node_ids_survive_a_persistence_round_trip_unchanged() {
        let tracker = test_tracker();
        let id = tracker.start_request(StoredRequest::new("A", "test"));
        tracker.complete_request(id).unwrap();

        let persistence = Persistence::new(Arc::clone(&tracker), PathBuf::from("/proj"), "v1", vec![], true);
        persistence.write_to_cache().await.unwrap();

        let restored = persistence
            .load_request_graph(&HashMap::new(), &HashMap::new())
            .await
            .unwrap();
        let restored_id = restored.id_for_request("A").expect("request A survived round-trip");
        assert_eq!(restored_id, id, "a NodeId held across a persist boundary must still resolve");

        // A node declared after restoration must not collide with anything just restored.
        let mut restored = restored;
        let fresh_id = restored.ensure_request(StoredRequest::new("B", "test"));
        assert_ne!(fresh_id, id);
    }

    #[tokio::test]
    async fn round_trips_a_file_dependent_request() {
        let tracker = test_tracker();
        let id = tracker.start_request(StoredRequest::new("A", "test"));
        tracker.with_graph(|g| g.invalidate_on_file_update(id, std::path::Path::new("/x.txt")).unwrap());
        tracker.complete_request(id).unwrap();

        let persistence = Persistence::new(
            Arc::clone(&tracker),
            PathBuf::from("/proj"),
            "v1",
            vec!["entry".to_string()],
            true,
        );
        persistence.write_to_cache().await.unwrap();

        let restored = persistence
            .load_request_graph(&HashMap::new(), &HashMap::new())
            .await
            .unwrap();
        let restored_id = restored.id_for_request("A").expect("request A survived round-trip");
        assert!(!restored.is_invalid(restored_id));

        let mut restored = restored;
        let changed = restored
            .respond_to_fs_events(&[Event {
                path: PathBuf::from("/x.txt"),
                kind: EventKind::Update,
            }])
            .unwrap();
        assert!(changed);
        assert!(restored.is_invalid(restored_id));
    }

    #[tokio::test]
    async fn disabled_caching_always_returns_fresh_graph() {
        let tracker = test_tracker();
        let persistence = Persistence::new(Arc::clone(&tracker), PathBuf::from("/proj"), "v1", vec![], false);
        persistence.write_to_cache().await.unwrap();
        let graph = persistence
            .load_request_graph(&HashMap::new(), &HashMap::new())
            .await
            .unwrap();
        assert!(!graph.has_invalid_requests());
    }

    #[tokio::test]
    async fn filename_above_trie_survives_round_trip() {
        let tracker = test_tracker();
        let id = tracker.start_request(StoredRequest::new("A", "test"));
        tracker.with_graph(|g| {
            g.invalidate_on_file_create(
                id,
                FileCreateInvalidation::FileNameAbove {
                    file_name: "node_modules/foo".to_string(),
                    above_file_path: PathBuf::from("/proj/src/index.js"),
                },
            )
            .unwrap()
        });
        tracker.complete_request(id).unwrap();

        let persistence = Persistence::new(Arc::clone(&tracker), PathBuf::from("/proj"), "v1", vec![], true);
        persistence.write_to_cache().await.unwrap();
        let mut restored = persistence
            .load_request_graph(&HashMap::new(), &HashMap::new())
            .await
            .unwrap();
        let restored_id = restored.id_for_request("A").unwrap();

        let changed = restored
            .respond_to_fs_events(&[Event {
                path: PathBuf::from("/proj/node_modules/foo"),
                kind: EventKind::Create,
            }])
            .unwrap();
        assert!(changed);
        assert!(restored.is_invalid(restored_id));
    }
}
