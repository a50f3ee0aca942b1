// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use crate::schema::NodeId;

/// The error taxonomy for the tracker. These are kinds, not wrapped foreign errors: the core
/// never needs to carry an arbitrary `Box<dyn Error>` because every failure it can produce is
/// one of the cases below.
#[derive(Clone, Debug)]
pub enum TrackerError {
    /// A request's `invalidate_on_file_create` argument did not match one of the three known
    /// shapes (glob / plain path / filename-above).
    InvalidInvalidation { detail: String },
    /// The abort signal was observed after a request body resolved. The request is left
    /// invalid so that a retry will re-run it.
    Cancelled { request_id: String },
    /// The request body itself returned an error. Carried as a string because request bodies
    /// are arbitrary user code with their own error types; the tracker only needs to propagate
    /// the message and mark the node invalid.
    RequestBodyFailed { request_id: String, message: String },
    /// A `result_cache_key` pointed at a cache entry that is missing or undeserializable.
    Corrupt { request_id: String, cache_key: String },
    /// An internal invariant was violated, e.g. a node id that should have been a Request was
    /// something else. Not recoverable; indicates a bug in the tracker itself.
    GraphInvariantViolation { detail: String },
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::InvalidInvalidation { detail } => {
                write!(f, "invalid invalidation spec: {detail}")
            }
            TrackerError::Cancelled { request_id } => {
                write!(f, "request `{request_id}` was cancelled")
            }
            TrackerError::RequestBodyFailed {
                request_id,
                message,
            } => {
                write!(f, "request `{request_id}` failed: {message}")
            }
            TrackerError::Corrupt {
                request_id,
                cache_key,
            } => write!(
                f,
                "result cache entry `{cache_key}` for request `{request_id}` is missing or corrupt"
            ),
            TrackerError::GraphInvariantViolation { detail } => {
                write!(f, "graph invariant violated: {detail}")
            }
        }
    }
}

impl std::error::Error for TrackerError {}

impl TrackerError {
    pub(crate) fn invariant(detail: impl Into<String>) -> TrackerError {
        TrackerError::GraphInvariantViolation {
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_invalidation(detail: impl Into<String>) -> TrackerError {
        TrackerError::InvalidInvalidation {
            detail: detail.into(),
        }
    }
}

/// A convenience error for callers that reach for a node id that isn't present at all (as
/// opposed to present-but-wrong-kind, which is a `GraphInvariantViolation`).
#[derive(Clone, Debug)]
pub struct UnknownNodeId(pub NodeId);

impl fmt::Display for UnknownNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no node with id {:?}", self.0)
    }
}

impl std::error::Error for UnknownNodeId {}

impl From<UnknownNodeId> for TrackerError {
    fn from(err: UnknownNodeId) -> TrackerError {
        TrackerError::GraphInvariantViolation {
            detail: err.to_string(),
        }
    }
}
