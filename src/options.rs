// Copyright 2026 the request_graph contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Host-supplied configuration: the knobs a binary embedding this crate would populate from CLI
//! flags or a config file. See `SPEC_FULL.md` §10.3.

use std::path::PathBuf;
use std::time::Duration;

/// Mirrors `Graph::new_with_invalidation_delay` in spirit: a small struct with a sane default
/// constructor (`TrackerOptions::new`) and an explicit builder for the one knob worth tuning.
#[derive(Clone, Debug)]
pub struct TrackerOptions {
    pub project_root: PathBuf,
    pub cache_directory: PathBuf,
    pub caching_enabled: bool,
    /// How long `Persistence` should wait after the last observed filesystem event before
    /// treating the watch as settled. Mirrors the teacher's `Graph::invalidation_delay`.
    pub invalidation_delay: Duration,
}

impl TrackerOptions {
    pub fn new(project_root: PathBuf, cache_directory: PathBuf) -> TrackerOptions {
        TrackerOptions {
            project_root,
            cache_directory,
            caching_enabled: true,
            invalidation_delay: Duration::from_millis(500),
        }
    }

    pub fn with_invalidation_delay(mut self, delay: Duration) -> TrackerOptions {
        self.invalidation_delay = delay;
        self
    }

    pub fn with_caching_enabled(mut self, enabled: bool) -> TrackerOptions {
        self.caching_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_defaults_to_caching_enabled() {
        let opts = TrackerOptions::new(PathBuf::from("/proj"), PathBuf::from("/proj/.cache"));
        assert!(opts.caching_enabled);
        assert_eq!(opts.invalidation_delay, Duration::from_millis(500));
    }

    #[test]
    fn builders_override_defaults() {
        let opts = TrackerOptions::new(PathBuf::from("/proj"), PathBuf::from("/proj/.cache"))
            .with_caching_enabled(false)
            .with_invalidation_delay(Duration::from_millis(50));
        assert!(!opts.caching_enabled);
        assert_eq!(opts.invalidation_delay, Duration::from_millis(50));
    }
}
