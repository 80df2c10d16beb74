use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of query execution profiling metrics.
///
/// Profiling is enabled via the `COHORT_PROFILE` environment variable and
/// tracks time spent in each stage of a query: category snapshot fetches,
/// leaf scans, set combinations and per-entity detail fetches.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent fetching category snapshots.
    pub snapshot_fetch_ns: u64,
    /// Number of category snapshot fetches.
    pub snapshot_fetch_count: u64,
    /// Total nanoseconds spent scanning leaves.
    pub leaf_scan_ns: u64,
    /// Number of leaf scans.
    pub leaf_scan_count: u64,
    /// Total nanoseconds spent in union/intersect.
    pub combine_ns: u64,
    /// Number of union/intersect operations.
    pub combine_count: u64,
    /// Total nanoseconds spent fetching entity details.
    pub detail_fetch_ns: u64,
    /// Number of entity detail fetches.
    pub detail_fetch_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    snapshot_fetch_ns: AtomicU64,
    snapshot_fetch_count: AtomicU64,
    leaf_scan_ns: AtomicU64,
    leaf_scan_count: AtomicU64,
    combine_ns: AtomicU64,
    combine_count: AtomicU64,
    detail_fetch_ns: AtomicU64,
    detail_fetch_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("COHORT_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    /// Whole-category reads.
    SnapshotFetch,
    /// Leaf candidate generation.
    LeafScan,
    /// Union and intersection.
    Combine,
    /// Per-entity reads of non-scanned categories.
    DetailFetch,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::SnapshotFetch => {
            (&counters.snapshot_fetch_ns, &counters.snapshot_fetch_count)
        }
        QueryProfileKind::LeafScan => (&counters.leaf_scan_ns, &counters.leaf_scan_count),
        QueryProfileKind::Combine => (&counters.combine_ns, &counters.combine_count),
        QueryProfileKind::DetailFetch => {
            (&counters.detail_fetch_ns, &counters.detail_fetch_count)
        }
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current query profiling metrics.
///
/// Returns `None` unless `COHORT_PROFILE` is set. With `reset`, counters are
/// zeroed as they are read.
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        snapshot_fetch_ns: load(&counters.snapshot_fetch_ns),
        snapshot_fetch_count: load(&counters.snapshot_fetch_count),
        leaf_scan_ns: load(&counters.leaf_scan_ns),
        leaf_scan_count: load(&counters.leaf_scan_count),
        combine_ns: load(&counters.combine_ns),
        combine_count: load(&counters.combine_count),
        detail_fetch_ns: load(&counters.detail_fetch_ns),
        detail_fetch_count: load(&counters.detail_fetch_count),
    })
}
