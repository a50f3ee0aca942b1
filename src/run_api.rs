// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-request façade a body receives: every dependency declaration, sub-request, and
//! result-store funnels through here so the tracker never has to trust the body to mutate the
//! graph directly.

use std::path::Path;
use std::sync::Arc;

use fnv::FnvHashSet as HashSet;
use parking_lot::Mutex;

use crate::error::TrackerError;
use crate::request_graph::Invalidation;
use crate::schema::{hash_option_value, AnyResult, FileCreateInvalidation, NodeId};
use crate::tracker::{Request, RequestTracker, RunOptions};

/// Captures `request_id` and accumulates the content keys of every sub-request touched during
/// this run, via `can_skip_subrequest`/`run_request`. That accumulator becomes the request's new
/// `subrequest` edge set once the body returns (see `RequestTracker::run_request` step 7).
pub struct RunApi {
    tracker: Arc<RequestTracker>,
    request_id: NodeId,
    sub_requests: Mutex<HashSet<String>>,
    invalidations_snapshot: Vec<Invalidation>,
}

impl RunApi {
    pub(crate) fn new(tracker: Arc<RequestTracker>, request_id: NodeId) -> RunApi {
        let invalidations_snapshot = tracker.with_graph(|g| g.invalidations_for(request_id));
        RunApi {
            tracker,
            request_id,
            sub_requests: Mutex::new(HashSet::default()),
            invalidations_snapshot,
        }
    }

    pub fn invalidate_on_file_update(&self, path: &Path) -> Result<(), TrackerError> {
        self.tracker
            .with_graph(|g| g.invalidate_on_file_update(self.request_id, path))
    }

    pub fn invalidate_on_file_delete(&self, path: &Path) -> Result<(), TrackerError> {
        self.tracker
            .with_graph(|g| g.invalidate_on_file_delete(self.request_id, path))
    }

    pub fn invalidate_on_file_create(&self, spec: FileCreateInvalidation) -> Result<(), TrackerError> {
        self.tracker
            .with_graph(|g| g.invalidate_on_file_create(self.request_id, spec))
    }

    pub fn invalidate_on_startup(&self) -> Result<(), TrackerError> {
        self.tracker
            .with_graph(|g| g.invalidate_on_startup(self.request_id))
    }

    pub fn invalidate_on_env_change(&self, name: &str, current_value: Option<String>) -> Result<(), TrackerError> {
        self.tracker
            .with_graph(|g| g.invalidate_on_env_change(self.request_id, name, current_value))
    }

    pub fn invalidate_on_option_change(&self, name: &str, current_value: &str) -> Result<(), TrackerError> {
        let hash = hash_option_value(current_value);
        self.tracker
            .with_graph(|g| g.invalidate_on_option_change(self.request_id, name, hash))
    }

    /// A snapshot of this request's invalidation edges taken when the API was constructed.
    /// Invalidations declared afterward (by this same run) do not appear here.
    pub fn get_invalidations(&self) -> &[Invalidation] {
        &self.invalidations_snapshot
    }

    pub fn store_result(&self, result: Arc<AnyResult>, cache_key: Option<String>) -> Result<(), TrackerError> {
        self.tracker.store_result(self.request_id, result, cache_key)
    }

    pub fn get_sub_requests(&self) -> Vec<String> {
        self.sub_requests.lock().iter().cloned().collect()
    }

    pub async fn get_request_result<T>(&self, id: &str) -> Result<Option<Arc<T>>, TrackerError>
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.tracker.get_request_result_by_key(id).await
    }

    /// Records `id` as a sub-request regardless of the return value, so its `subrequest` edge
    /// survives even when the caller skips re-running it.
    pub fn can_skip_subrequest(&self, id: &str) -> bool {
        self.sub_requests.lock().insert(id.to_string());
        self.tracker.has_valid_result_by_key(id)
    }

    pub async fn run_request<R: Request>(&self, request: R) -> Result<Arc<R::Output>, TrackerError> {
        self.sub_requests.lock().insert(request.id());
        self.tracker
            .run_request(request, RunOptions::default())
            .await
    }
}
