// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! A content-addressed, incremental request graph: six node kinds (file, glob, filename, env,
//! option, request) wired together by typed invalidation edges, with cache-backed memoization
//! and a filesystem-event-driven invalidation pass.
//!
//! The typical shape of use is: implement [`tracker::Request`] for each kind of work your host
//! program performs, drive it through a shared [`tracker::RequestTracker`], and let requests
//! declare their own dependencies via the [`run_api::RunApi`] they're handed at run time. On
//! startup, [`persist::Persistence`] can restore a previous run's graph and reconcile it against
//! whatever changed on disk while the process wasn't running.

pub mod collaborators;
pub mod content_graph;
pub mod error;
pub mod options;
pub mod persist;
pub mod request_graph;
pub mod run_api;
pub mod schema;
pub mod tracker;

pub use collaborators::{Cache, InputFs, WatcherOptions, WorkerPool};
pub use error::TrackerError;
pub use options::TrackerOptions;
pub use persist::Persistence;
pub use request_graph::{Event, EventKind, Invalidation, RequestGraph};
pub use run_api::RunApi;
pub use schema::{
    AnyResult, Edge, FileCreateInvalidation, InvalidateReason, Node, NodeId, NodeKind,
    StoredRequest,
};
pub use tracker::{CancellationToken, Request, RequestTracker, RunContext, RunOptions};

/// Logs at trace level, but only in `cfg(test)`.
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}
