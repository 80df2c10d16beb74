//! In-memory store backed by a JSON document, for fixtures and tests.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{RemoteStore, StoreError, StorePath, StoreResult};

/// Store serving subtrees of a single JSON document.
#[derive(Debug, Default)]
pub struct MemoryStore {
    root: Value,
    failures: HashSet<String>,
    latency: Option<Duration>,
    stats: MemoryStats,
}

#[derive(Debug, Default)]
struct MemoryStats {
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a MemoryStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a MemoryStats) -> Self {
        stats.requests.fetch_add(1, Ordering::Relaxed);
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    /// Serves `root`, whose top-level keys are category names.
    pub fn from_value(root: Value) -> Self {
        Self {
            root,
            ..Self::default()
        }
    }

    /// Loads a JSON fixture file.
    pub fn from_path(path: &Path) -> StoreResult<Self> {
        let file = File::open(path).map_err(|source| StoreError::Fixture {
            path: path.to_path_buf(),
            source,
        })?;
        let root = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            StoreError::Decode {
                path: path.display().to_string(),
                message: err.to_string(),
            }
        })?;
        tracing::info!(path = %path.display(), "loaded store fixture");
        Ok(Self::from_value(root))
    }

    /// Makes every read of `path` (rendered as `a/b/c`) fail.
    pub fn with_failure(mut self, path: impl Into<String>) -> Self {
        self.failures.insert(path.into());
        self
    }

    /// Delays every read by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reads served so far.
    pub fn requests(&self) -> usize {
        self.stats.requests.load(Ordering::Relaxed)
    }

    /// Highest number of reads observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get_subtree(&self, path: &StorePath) -> StoreResult<Value> {
        let _guard = InFlight::enter(&self.stats);
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
        let rendered = path.to_string();
        if self.failures.contains(&rendered) {
            return Err(StoreError::Unavailable { path: rendered });
        }
        let found = path
            .segments()
            .iter()
            .try_fold(&self.root, |node, segment| node.as_object()?.get(segment));
        Ok(found.cloned().unwrap_or(Value::Null))
    }

    fn describe(&self) -> String {
        "memory".to_owned()
    }
}
