// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Traits for the external systems the tracker depends on but does not implement: the
//! content-addressed object cache, the filesystem watcher/snapshot facility, and the worker pool.
//! Production callers supply real implementations; tests use the in-memory ones below.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::request_graph::Event;

/// The content-addressed object cache. The core only ever needs get/set and a path for entries it
/// writes itself (e.g. the serialized graph).
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> std::io::Result<()>;
    fn cache_path(&self, key: &str, ext: &str) -> PathBuf;
}

#[derive(Clone, Debug)]
pub struct WatcherOptions {
    pub ignore: Vec<PathBuf>,
}

/// The filesystem watcher/snapshot facility. `write_snapshot` mints an opaque cookie at
/// `snapshot_path`; `events_since` replays everything that happened after it.
#[async_trait]
pub trait InputFs: Send + Sync {
    async fn write_snapshot(
        &self,
        root: &Path,
        snapshot_path: &Path,
        opts: &WatcherOptions,
    ) -> std::io::Result<()>;

    async fn events_since(
        &self,
        root: &Path,
        snapshot_path: &Path,
        opts: &WatcherOptions,
    ) -> std::io::Result<Vec<Event>>;
}

/// An opaque handle to the worker pool, forwarded to request bodies untouched. The core never
/// schedules work on it itself.
pub trait WorkerPool: Send + Sync {}

/// An in-memory `Cache` for tests: a `Mutex`-guarded map, matching the teacher's style of testing
/// against real (if trivial) collaborator implementations rather than mocks.
#[cfg(any(test, feature = "testutil"))]
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    base_dir: PathBuf,
}

#[cfg(any(test, feature = "testutil"))]
impl InMemoryCache {
    pub fn new(base_dir: PathBuf) -> InMemoryCache {
        InMemoryCache {
            entries: Mutex::new(HashMap::new()),
            base_dir,
        }
    }
}

#[cfg(any(test, feature = "testutil"))]
#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> std::io::Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn cache_path(&self, key: &str, ext: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.{ext}"))
    }
}

/// An in-memory `InputFs` for tests: `write_snapshot` just remembers how many events had been
/// recorded so far, and `events_since` replays everything recorded after that point.
#[cfg(any(test, feature = "testutil"))]
#[derive(Default)]
pub struct InMemoryFs {
    events: Mutex<Vec<Event>>,
    snapshots: Mutex<HashMap<PathBuf, usize>>,
}

#[cfg(any(test, feature = "testutil"))]
impl InMemoryFs {
    pub fn new() -> InMemoryFs {
        InMemoryFs::default()
    }

    pub fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(any(test, feature = "testutil"))]
#[async_trait]
impl InputFs for InMemoryFs {
    async fn write_snapshot(
        &self,
        _root: &Path,
        snapshot_path: &Path,
        _opts: &WatcherOptions,
    ) -> std::io::Result<()> {
        let count = self.events.lock().unwrap().len();
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot_path.to_path_buf(), count);
        Ok(())
    }

    async fn events_since(
        &self,
        _root: &Path,
        snapshot_path: &Path,
        _opts: &WatcherOptions,
    ) -> std::io::Result<Vec<Event>> {
        let from = self
            .snapshots
            .lock()
            .unwrap()
            .get(snapshot_path)
            .copied()
            .unwrap_or(0);
        Ok(self.events.lock().unwrap()[from..].to_vec())
    }
}

#[cfg(any(test, feature = "testutil"))]
pub struct NoopWorkerPool;

#[cfg(any(test, feature = "testutil"))]
impl WorkerPool for NoopWorkerPool {}

/// What `RequestTracker`/`Persistence` hold onto: trait objects rather than a generic parameter,
/// since a tracker is built once at startup against whatever collaborators the host supplies.
pub type SharedCache = Arc<dyn Cache>;
pub type SharedFs = Arc<dyn InputFs>;
