// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The typed node/edge schema for a [`crate::request_graph::RequestGraph`]: six node kinds, six
//! edge labels, and the `InvalidateReason` bitmask that request nodes accumulate.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A node identity: a monotonically increasing counter minted by `ContentGraph`, independent of
/// whatever storage index the underlying `petgraph` graph uses internally. Never reused for the
/// lifetime of a graph, so ids embedded in a serialized blob stay meaningful even after a
/// `removeNode` recycled the corresponding petgraph storage slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn from_raw(raw: u64) -> NodeId {
        NodeId(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value that can be stored inline on a Request node. Request results are heterogeneous across
/// request types (a parse request and a bundle request have nothing in common), so the tracker
/// stores them behind a type-erased handle and hands typed access back to callers via
/// `downcast_ref`/`downcast`, the same way the graph itself only reasons about *kinds* of node,
/// not about request-specific payloads.
pub type AnyResult = dyn Any + Send + Sync;

/// Six edge kinds. Different labels carry different invalidation semantics; a single pair of
/// nodes may have at most one edge per label (`ContentGraph::add_edge` is idempotent on (from,
/// to, label)).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Edge {
    /// parent request -> child request.
    Subrequest,
    /// request -> file/env/option: an update to the target invalidates the source.
    InvalidatedByUpdate,
    /// request -> file: deletion of the target invalidates the source.
    InvalidatedByDelete,
    /// request -> file/glob/filename: creation of a matching path invalidates the source.
    InvalidatedByCreate,
    /// Paired edges forming the filename-trie for "create above" predicates. See
    /// `request_graph::invalidate_on_file_create`.
    InvalidatedByCreateAbove,
    /// filename-segment -> parent filename-segment.
    Dirname,
}

/// Bitmask of reasons a request node has been (re-)invalidated since it last completed
/// successfully. OR-composable and stable on disk: these values must not be renumbered once
/// persisted graphs exist in the wild.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct InvalidateReason(u32);

impl InvalidateReason {
    pub const VALID: InvalidateReason = InvalidateReason(0);
    pub const INITIAL_BUILD: InvalidateReason = InvalidateReason(1 << 0);
    pub const FILE_CREATE: InvalidateReason = InvalidateReason(1 << 1);
    pub const FILE_UPDATE: InvalidateReason = InvalidateReason(1 << 2);
    pub const FILE_DELETE: InvalidateReason = InvalidateReason(1 << 3);
    pub const ENV_CHANGE: InvalidateReason = InvalidateReason(1 << 4);
    pub const OPTION_CHANGE: InvalidateReason = InvalidateReason(1 << 5);
    pub const STARTUP: InvalidateReason = InvalidateReason(1 << 6);
    pub const ERROR: InvalidateReason = InvalidateReason(1 << 7);

    pub fn is_valid(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: InvalidateReason) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: InvalidateReason) -> InvalidateReason {
        InvalidateReason(self.0 | other.0)
    }

    pub(crate) fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for InvalidateReason {
    type Output = InvalidateReason;

    fn bitor(self, rhs: InvalidateReason) -> InvalidateReason {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for InvalidateReason {
    fn bitor_assign(&mut self, rhs: InvalidateReason) {
        *self = self.union(rhs);
    }
}

/// A request as stored on a Request node: identity, the opaque input that produced that
/// identity, and whatever result/cache-key the most recent successful run left behind.
#[derive(Clone)]
pub struct StoredRequest {
    pub id: String,
    pub request_type: String,
    /// The type-erased input that produced this request's id. Kept around so a body can compare
    /// its previous input or so tooling can explain why a node exists; the tracker itself never
    /// inspects it.
    pub input: Option<Arc<AnyResult>>,
    /// Inline result from the last successful run, if any and if it hasn't been evicted to the
    /// object cache by `Persistence::write_to_cache`.
    pub result: Option<Arc<AnyResult>>,
    /// Key under which the result can be fetched from the object cache, if it was evicted there.
    pub result_cache_key: Option<String>,
    pub invalidate_reason: InvalidateReason,
}

impl fmt::Debug for StoredRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredRequest")
            .field("id", &self.id)
            .field("request_type", &self.request_type)
            .field("has_input", &self.input.is_some())
            .field("has_result", &self.result.is_some())
            .field("result_cache_key", &self.result_cache_key)
            .field("invalidate_reason", &self.invalidate_reason)
            .finish()
    }
}

impl StoredRequest {
    pub fn new(id: impl Into<String>, request_type: impl Into<String>) -> StoredRequest {
        StoredRequest {
            id: id.into(),
            request_type: request_type.into(),
            input: None,
            result: None,
            result_cache_key: None,
            invalidate_reason: InvalidateReason::INITIAL_BUILD,
        }
    }

    pub fn with_input(mut self, input: Arc<AnyResult>) -> StoredRequest {
        self.input = Some(input);
        self
    }
}

/// One node of the six-kind discriminated union. Each variant knows how to render its own
/// content key; `Node::content_key` is what `ContentGraph` deduplicates on.
#[derive(Clone, Debug)]
pub enum Node {
    File(PathBuf),
    Glob(String),
    FileName(String),
    Env { name: String, value: Option<String> },
    Option { name: String, hash: [u8; 32] },
    Request(StoredRequest),
}

impl Node {
    pub fn content_key(&self) -> String {
        match self {
            Node::File(path) => path.display().to_string(),
            Node::Glob(pattern) => pattern.clone(),
            Node::FileName(segment) => format!("file_name:{segment}"),
            Node::Env { name, .. } => format!("env:{name}"),
            Node::Option { name, .. } => format!("option:{name}"),
            Node::Request(req) => req.id.clone(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::File(_) => NodeKind::File,
            Node::Glob(_) => NodeKind::Glob,
            Node::FileName(_) => NodeKind::FileName,
            Node::Env { .. } => NodeKind::Env,
            Node::Option { .. } => NodeKind::Option,
            Node::Request(_) => NodeKind::Request,
        }
    }

    pub fn as_request(&self) -> Option<&StoredRequest> {
        match self {
            Node::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_request_mut(&mut self) -> Option<&mut StoredRequest> {
        match self {
            Node::Request(req) => Some(req),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeKind {
    File,
    Glob,
    FileName,
    Env,
    Option,
    Request,
}

/// Hashes an option value for storage on an Option node; `InvalidateReason::OPTION_CHANGE`
/// detection compares these digests rather than raw values so large option payloads don't need
/// to be retained.
pub fn hash_option_value(value: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

/// The three shapes a request may pass to `invalidate_on_file_create`. Anything that doesn't
/// parse into one of these is an `InvalidInvalidation` error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileCreateInvalidation {
    Glob(String),
    FilePath(PathBuf),
    FileNameAbove {
        file_name: String,
        above_file_path: PathBuf,
    },
}
