// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Request lifecycle: start/complete/reject, memoization, and the `run_request` orchestration
//! that ties a `RunApi` to a user-supplied request body.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::collaborators::{SharedCache, SharedFs, WorkerPool};
use crate::error::{TrackerError, UnknownNodeId};
use crate::request_graph::{Event, RequestGraph};
use crate::schema::{AnyResult, InvalidateReason, Node, NodeId, StoredRequest};

/// A request body: identity, the `run` entry point, and the output/error types it produces.
/// `run_request` is generic over `R`, so heterogeneous request types share one graph without the
/// trait itself needing to be object-safe.
#[async_trait]
pub trait Request: Send + Sync {
    type Output: Send + Sync + 'static;
    type Error: std::fmt::Display + Send + Sync + 'static;

    fn id(&self) -> String;
    fn request_type(&self) -> &'static str;
    async fn run(&self, ctx: &RunContext<'_>) -> Result<Self::Output, Self::Error>;
}

pub struct RunContext<'a> {
    pub api: &'a crate::run_api::RunApi,
    pub farm: Arc<dyn WorkerPool>,
    pub options: HashMap<String, String>,
    pub prev_result: Option<Arc<AnyResult>>,
    pub invalidate_reason: InvalidateReason,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    pub force: bool,
}

/// A cooperative abort signal shared between a tracker and whoever owns its lifecycle. Checked
/// once, after a request body resolves; long-running bodies are expected to observe it
/// themselves for faster cancellation (see `SPEC_FULL.md` §5).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Owns a `RequestGraph`, a worker-pool handle, the current option set, and an optional
/// cancellation signal. All graph access goes through `with_graph`, so every public method here
/// is atomic with respect to the graph even though request bodies themselves may suspend.
pub struct RequestTracker {
    graph: Mutex<RequestGraph>,
    cache: SharedCache,
    fs: SharedFs,
    pool: Arc<dyn WorkerPool>,
    option_values: Mutex<HashMap<String, String>>,
    cancel: Option<CancellationToken>,
}

impl RequestTracker {
    pub fn new(
        cache: SharedCache,
        fs: SharedFs,
        pool: Arc<dyn WorkerPool>,
        options: HashMap<String, String>,
    ) -> RequestTracker {
        RequestTracker {
            graph: Mutex::new(RequestGraph::new()),
            cache,
            fs,
            pool,
            option_values: Mutex::new(options),
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> RequestTracker {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn with_graph<T>(&self, f: impl FnOnce(&mut RequestGraph) -> T) -> T {
        let mut g = self.graph.lock();
        f(&mut g)
    }

    pub(crate) fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub(crate) fn fs(&self) -> &SharedFs {
        &self.fs
    }

    pub fn option_values(&self) -> HashMap<String, String> {
        self.option_values.lock().clone()
    }

    pub fn set_option_values(&self, options: HashMap<String, String>) {
        *self.option_values.lock() = options;
    }

    pub fn has_invalid_requests(&self) -> bool {
        self.with_graph(|g| g.has_invalid_requests())
    }

    pub fn respond_to_fs_events(&self, events: &[Event]) -> Result<bool, TrackerError> {
        self.with_graph(|g| g.respond_to_fs_events(events))
    }

    /// Replaces the tracker's graph wholesale, used by `Persistence::load_request_graph` to hand
    /// back a reconciled graph at startup.
    pub fn replace_graph(&self, graph: RequestGraph) {
        *self.graph.lock() = graph;
    }

    // -- Request lifecycle (§4.4) ----------------------------------------------------------------

    pub fn start_request(&self, stored: StoredRequest) -> NodeId {
        self.with_graph(|g| {
            let id = match g.id_for_request(&stored.id) {
                Some(id) => {
                    g.clear_invalidations(id)
                        .expect("start_request: existing node is a Request");
                    id
                }
                None => g.ensure_request(stored),
            };
            g.mark_incomplete(id);
            g.clear_invalid_flag(id);
            id
        })
    }

    pub fn store_result(
        &self,
        id: NodeId,
        result: Arc<AnyResult>,
        cache_key: Option<String>,
    ) -> Result<(), TrackerError> {
        self.with_graph(|g| {
            let node = g.node_mut(id).ok_or(UnknownNodeId(id))?;
            let req = node
                .as_request_mut()
                .ok_or_else(|| TrackerError::invariant("store_result: node is not a Request"))?;
            req.result = Some(result);
            req.result_cache_key = cache_key;
            Ok(())
        })
    }

    pub fn has_valid_result(&self, id: NodeId) -> bool {
        self.with_graph(|g| g.node(id).is_some() && !g.is_invalid(id) && !g.is_incomplete(id))
    }

    pub fn has_valid_result_by_key(&self, request_id: &str) -> bool {
        self.with_graph(|g| match g.id_for_request(request_id) {
            Some(id) => !g.is_invalid(id) && !g.is_incomplete(id),
            None => false,
        })
    }

    /// Same-process-only result lookup: just a downcast of whatever is stored inline, with no
    /// deserialization path. `Request::Output` is only `Send + Sync + 'static` (not
    /// `DeserializeOwned`), so this is what `run_request`'s cache check uses — a request type
    /// that doesn't implement `Deserialize` can still get a same-run cache hit, it just can't be
    /// restored from a cache-evicted result (see `get_request_result` for that path).
    fn inline_result<T: Send + Sync + 'static>(&self, id: NodeId) -> Option<Arc<T>> {
        let result = self.with_graph(|g| g.node(id).and_then(Node::as_request).and_then(|r| r.result.clone()))?;
        result.downcast::<T>().ok()
    }

    /// Fetches a request's result by node id: the inline copy if present, otherwise the object
    /// cache via `result_cache_key`, caching the deserialized value back onto the node.
    pub async fn get_request_result<T>(&self, id: NodeId) -> Result<Option<Arc<T>>, TrackerError>
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        let (inline, cache_key, request_id) = self.with_graph(|g| {
            let req = g.node(id).and_then(Node::as_request);
            match req {
                Some(r) => (r.result.clone(), r.result_cache_key.clone(), r.id.clone()),
                None => (None, None, String::new()),
            }
        });
        if let Some(result) = inline {
            // The common case: the body's own output, still in memory. Fall back to treating it
            // as pre-serialized bytes only if it isn't already a `T` (possible if this node's
            // result was restored from a persisted graph and then re-populated from cache by an
            // earlier call to this same method, which stores the deserialized bytes verbatim).
            match result.downcast::<T>() {
                Ok(typed) => return Ok(Some(typed)),
                Err(erased) => {
                    if let Ok(bytes) = erased.downcast::<Vec<u8>>() {
                        let value: T = bincode::deserialize(&bytes).map_err(|_| TrackerError::Corrupt {
                            request_id: request_id.clone(),
                            cache_key: cache_key.clone().unwrap_or_default(),
                        })?;
                        return Ok(Some(Arc::new(value)));
                    }
                    return Err(TrackerError::invariant(format!(
                        "request `{request_id}` result type mismatch"
                    )));
                }
            }
        }
        let Some(cache_key) = cache_key else {
            return Ok(None);
        };
        let bytes = self.cache.get(&cache_key).await.map_err(|_| TrackerError::Corrupt {
            request_id: request_id.clone(),
            cache_key: cache_key.clone(),
        })?;
        let Some(bytes) = bytes else {
            return Err(TrackerError::Corrupt {
                request_id,
                cache_key,
            });
        };
        let value: T = bincode::deserialize(&bytes).map_err(|_| TrackerError::Corrupt {
            request_id: request_id.clone(),
            cache_key: cache_key.clone(),
        })?;
        let arc = Arc::new(value);
        self.store_result(id, arc.clone(), Some(cache_key))?;
        Ok(Some(arc))
    }

    /// Sync, inline-only lookup by content key. Used by `RunApi::get_request_result` for
    /// sub-requests resolved earlier in the same process; falls through to the object cache via
    /// `get_request_result` only when the caller needs that (kept separate because this path
    /// doesn't need to be async in the common case).
    pub async fn get_request_result_by_key<T>(&self, request_id: &str) -> Result<Option<Arc<T>>, TrackerError>
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        let Some(id) = self.with_graph(|g| g.id_for_request(request_id)) else {
            return Ok(None);
        };
        self.get_request_result(id).await
    }

    pub fn complete_request(&self, id: NodeId) -> Result<(), TrackerError> {
        self.with_graph(|g| g.mark_complete(id))
    }

    pub fn reject_request(&self, id: NodeId) -> Result<(), TrackerError> {
        self.with_graph(|g| {
            g.mark_incomplete_removed(id);
            g.invalidate_node(id, InvalidateReason::ERROR)
        })
    }

    /// The 7-step algorithm of §4.4: cache check, start, run, cancellation check, complete/reject,
    /// and an unconditional subrequest-edge replacement that runs even when the body was
    /// cancelled or failed.
    pub async fn run_request<R: Request>(
        self: &Arc<Self>,
        request: R,
        opts: RunOptions,
    ) -> Result<Arc<R::Output>, TrackerError> {
        let request_id_str = request.id();

        if !opts.force {
            if let Some(id) = self.with_graph(|g| g.id_for_request(&request_id_str)) {
                if self.has_valid_result(id) {
                    if let Some(result) = self.inline_result::<R::Output>(id) {
                        debug!("cache hit for request `{request_id_str}`");
                        return Ok(result);
                    }
                }
            }
        }

        let stored = StoredRequest::new(request_id_str.clone(), request.request_type());
        let id = self.start_request(stored);

        let (prev_result, invalidate_reason) = self.with_graph(|g| {
            let req = g.node(id).and_then(Node::as_request);
            (
                req.and_then(|r| r.result.clone()),
                req.map(|r| r.invalidate_reason)
                    .unwrap_or(InvalidateReason::INITIAL_BUILD),
            )
        });

        let api = crate::run_api::RunApi::new(Arc::clone(self), id);
        let ctx = RunContext {
            api: &api,
            farm: Arc::clone(&self.pool),
            options: self.option_values(),
            prev_result,
            invalidate_reason,
        };

        let run_result = request.run(&ctx).await;
        let cancelled = self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled);

        let final_result: Result<Arc<AnyResult>, TrackerError> = if cancelled {
            self.with_graph(|g| {
                g.mark_incomplete_removed(id);
                g.invalidate_node(id, InvalidateReason::ERROR)
            })?;
            Err(TrackerError::Cancelled {
                request_id: request_id_str.clone(),
            })
        } else {
            match run_result {
                Ok(output) => {
                    let arc_output: Arc<AnyResult> = Arc::new(output);
                    // A body may have already called `RunApi::store_result` to declare a cache
                    // key for this run (e.g. one derived from content it hashed itself); preserve
                    // it rather than clobbering it with `None`. The returned `output` is always
                    // the value actually stored, regardless of what the body passed there.
                    let cache_key = self.with_graph(|g| {
                        g.node(id)
                            .and_then(Node::as_request)
                            .and_then(|r| r.result_cache_key.clone())
                    });
                    self.store_result(id, Arc::clone(&arc_output), cache_key)?;
                    self.complete_request(id)?;
                    Ok(arc_output)
                }
                Err(err) => {
                    warn!("request `{request_id_str}` failed: {err}");
                    self.reject_request(id)?;
                    Err(TrackerError::RequestBodyFailed {
                        request_id: request_id_str.clone(),
                        message: err.to_string(),
                    })
                }
            }
        };

        // Step 7: runs regardless of the outcome above, so a cancelled or failed run still
        // records whatever sub-requests it reached before stopping.
        let sub_request_ids: Vec<NodeId> = api
            .get_sub_requests()
            .into_iter()
            .filter_map(|key| self.with_graph(|g| g.id_for_request(&key)))
            .collect();
        self.with_graph(|g| g.replace_subrequests(id, sub_request_ids));

        let output = final_result?;
        output
            .downcast::<R::Output>()
            .map_err(|_| TrackerError::invariant("run_request: result type mismatch"))
    }
}

#[cfg(test)]
mod integration_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::collaborators::{InMemoryCache, InMemoryFs, NoopWorkerPool};
    use crate::schema::InvalidateReason;

    use super::*;

    fn test_tracker() -> Arc<RequestTracker> {
        let _ = env_logger::try_init();
        Arc::new(RequestTracker::new(
            Arc::new(InMemoryCache::new(std::path::PathBuf::from("/cache"))),
            Arc::new(InMemoryFs::new()),
            Arc::new(NoopWorkerPool),
            HashMap::new(),
        ))
    }

    /// A request whose body just counts its own invocations, so tests can assert a cache hit
    /// never re-runs it.
    struct CountingRequest {
        id: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Request for CountingRequest {
        type Output = usize;
        type Error = String;

        fn id(&self) -> String {
            self.id.clone()
        }

        fn request_type(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, _ctx: &RunContext<'_>) -> Result<usize, String> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    /// A request whose body runs a `CountingRequest` child as a sub-request, so tests can assert
    /// sub-request edges and reuse across parent re-runs.
    struct ParentRequest {
        id: String,
        child_id: String,
        child_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Request for ParentRequest {
        type Output = usize;
        type Error = String;

        fn id(&self) -> String {
            self.id.clone()
        }

        fn request_type(&self) -> &'static str {
            "parent"
        }

        async fn run(&self, ctx: &RunContext<'_>) -> Result<usize, String> {
            let child = CountingRequest {
                id: self.child_id.clone(),
                calls: Arc::clone(&self.child_calls),
            };
            let result = ctx.api.run_request(child).await.map_err(|e| e.to_string())?;
            Ok(*result)
        }
    }

    /// A request whose body runs a child sub-request and then always fails, so tests can assert
    /// that a rejected request still records the sub-requests it reached before failing.
    struct FailingRequest {
        id: String,
        child_id: String,
        child_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Request for FailingRequest {
        type Output = ();
        type Error = String;

        fn id(&self) -> String {
            self.id.clone()
        }

        fn request_type(&self) -> &'static str {
            "failing"
        }

        async fn run(&self, ctx: &RunContext<'_>) -> Result<(), String> {
            let child = CountingRequest {
                id: self.child_id.clone(),
                calls: Arc::clone(&self.child_calls),
            };
            ctx.api.run_request(child).await.map_err(|e| e.to_string())?;
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn cache_hit_does_not_re_invoke_the_body() {
        let tracker = test_tracker();
        let calls = Arc::new(AtomicUsize::new(0));
        let request = || CountingRequest {
            id: "a".to_string(),
            calls: Arc::clone(&calls),
        };

        let first = tracker.run_request(request(), RunOptions::default()).await.unwrap();
        assert_eq!(*first, 1);

        let second = tracker.run_request(request(), RunOptions::default()).await.unwrap();
        assert_eq!(*second, 1, "second run should return the cached result, not a fresh one");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "body must not be invoked twice");
    }

    #[tokio::test]
    async fn sub_request_is_reused_across_a_forced_parent_re_run() {
        let tracker = test_tracker();
        let child_calls = Arc::new(AtomicUsize::new(0));
        let parent = || ParentRequest {
            id: "parent".to_string(),
            child_id: "child".to_string(),
            child_calls: Arc::clone(&child_calls),
        };

        tracker.run_request(parent(), RunOptions::default()).await.unwrap();
        assert_eq!(child_calls.load(Ordering::SeqCst), 1);

        // Force the parent to re-run its body; the child it calls through `RunApi::run_request`
        // should still be a cache hit since nothing invalidated it.
        tracker
            .run_request(parent(), RunOptions { force: true })
            .await
            .unwrap();
        assert_eq!(
            child_calls.load(Ordering::SeqCst),
            1,
            "child sub-request must not be re-run when its result is still valid"
        );

        let (parent_id, child_id) = tracker.with_graph(|g| {
            (
                g.id_for_request("parent").unwrap(),
                g.id_for_request("child").unwrap(),
            )
        });
        let subrequests = tracker.with_graph(|g| g.subrequests_of(parent_id));
        assert_eq!(subrequests, vec![child_id], "subrequest edge must survive the re-run");
    }

    #[tokio::test]
    async fn rejected_request_leaves_the_graph_consistent() {
        let tracker = test_tracker();
        let child_calls = Arc::new(AtomicUsize::new(0));
        let failing = FailingRequest {
            id: "will-fail".to_string(),
            child_id: "child-of-failure".to_string(),
            child_calls: Arc::clone(&child_calls),
        };

        let err = tracker.run_request(failing, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, TrackerError::RequestBodyFailed { .. }));

        let (parent_id, child_id) = tracker.with_graph(|g| {
            (
                g.id_for_request("will-fail").unwrap(),
                g.id_for_request("child-of-failure").unwrap(),
            )
        });
        assert!(tracker.with_graph(|g| g.is_invalid(parent_id)));
        let reason = tracker.with_graph(|g| {
            g.node(parent_id)
                .and_then(Node::as_request)
                .unwrap()
                .invalidate_reason
        });
        assert!(reason.contains(InvalidateReason::ERROR));

        let subrequests = tracker.with_graph(|g| g.subrequests_of(parent_id));
        assert_eq!(
            subrequests,
            vec![child_id],
            "subrequest reached before the failure must still be recorded"
        );
    }
}
