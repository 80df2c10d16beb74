//! Batch fetch and streaming coordinator.
//!
//! One query runs as: fetch every required category snapshot concurrently,
//! evaluate the plan, fetch the remaining categories for each candidate in
//! bounded waves, then materialize phase-filtered profiles. Progress is
//! reported as [`QueryEvent`] frames through an [`EventSink`] in the order
//! work completes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{CohortError, Result};
use crate::model::{EntityKey, NodeCategory, PhaseTag};
use crate::query::candidates::{Candidate, CandidateSet};
use crate::query::evaluator::{evaluate, EvalContext};
use crate::query::planner::{explain, PlanExplain, Planner, PlannerConfig, QueryPlan, Strategy};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::{QueryError, QueryRequest};
use crate::schema::FieldSchema;
use crate::store::{fetch_snapshot, RemoteStore, Snapshots, StorePath};
use crate::temporal::{self, PhaseCutoff, PhaseMode};

const EVENT_BUFFER: usize = 64;

/// Terminal error payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorFrame {
    /// HTTP status equivalent.
    pub status: u16,
    /// Human-readable message.
    pub message: String,
}

/// One NDJSON frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryEvent {
    /// A category snapshot arrived.
    Fetching {
        /// Category fetched.
        fetching: NodeCategory,
    },
    /// Another candidate's details arrived; `processed` counts all so far.
    Processed {
        /// Entities completed.
        processed: usize,
    },
    /// The grouped-intersection strategy was chosen.
    Mode {
        /// Strategy name.
        mode: String,
        /// Number of groups.
        groups: usize,
    },
    /// A group is being evaluated.
    Group {
        /// 1-based group number.
        group: usize,
        /// Rendering of the group.
        query: String,
    },
    /// Final result set.
    Data {
        /// One profile per matched entity.
        data: Vec<EntityProfile>,
    },
    /// The query failed after the stream opened.
    Error {
        /// Failure details.
        error: ErrorFrame,
    },
}

impl QueryEvent {
    /// Error frame for `err`.
    pub fn error(err: &CohortError) -> Self {
        QueryEvent::Error {
            error: ErrorFrame {
                status: err.http_status(),
                message: err.to_string(),
            },
        }
    }

    /// Whether no frame follows this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryEvent::Data { .. } | QueryEvent::Error { .. })
    }

    /// The frame as one newline-terminated JSON line.
    pub fn to_ndjson(&self) -> std::result::Result<Bytes, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}

/// Materialized result for one entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityProfile {
    /// Entity identity, flattened into `region`, `subregion` and `id`.
    #[serde(flatten)]
    pub key: EntityKey,
    /// Phase the entity matched in.
    pub phase: PhaseTag,
    /// Phase-filtered data per category; `null` when absent or unfetchable.
    pub nodes: BTreeMap<NodeCategory, Value>,
}

/// Shared cancellation signal.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Destination of progress frames.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<QueryEvent>,
    cancel: CancelFlag,
}

impl EventSink {
    /// Sink writing to `tx` and observing `cancel`.
    pub fn new(tx: mpsc::Sender<QueryEvent>, cancel: CancelFlag) -> Self {
        Self { tx, cancel }
    }

    /// Sends a frame. Fails with [`CohortError::Cancelled`] once the query was
    /// cancelled or the receiver went away; the latter also raises the flag.
    pub async fn emit(&self, event: QueryEvent) -> Result<()> {
        self.check()?;
        self.tx.send(event).await.map_err(|_| {
            self.cancel.cancel();
            CohortError::Cancelled
        })
    }

    /// Fails with [`CohortError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CohortError::Cancelled);
        }
        Ok(())
    }

    async fn finish(&self, event: QueryEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("receiver gone before terminal frame");
        }
    }
}

/// Receiving end of a streamed query.
#[derive(Debug)]
pub struct QueryStream {
    /// Frames in completion order; the last one is terminal.
    pub events: mpsc::Receiver<QueryEvent>,
    /// Cancels the query when raised.
    pub cancel: CancelFlag,
}

/// Tuning knobs for the coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    /// Concurrent entity fetches per wave.
    pub batch_size: usize,
    /// Deadline for a whole query.
    pub query_timeout: Duration,
    /// Phase boundary.
    pub cutoff: PhaseCutoff,
    /// Length of the region prefix of subregion ids.
    pub subregion_prefix_len: usize,
    /// Planner settings.
    pub planner: PlannerConfig,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for CoordinatorOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.engine.batch_size.max(1),
            query_timeout: config.engine.query_timeout(),
            cutoff: config.phase,
            subregion_prefix_len: config.engine.subregion_prefix_len,
            planner: PlannerConfig {
                grouped_intersection: config.engine.grouped_intersection,
            },
        }
    }
}

/// Runs queries against one store.
pub struct Coordinator {
    store: Arc<dyn RemoteStore>,
    schema: Arc<FieldSchema>,
    planner: Planner,
    options: CoordinatorOptions,
}

impl Coordinator {
    /// Coordinator over `store` using `schema`.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        schema: Arc<FieldSchema>,
        options: CoordinatorOptions,
    ) -> Self {
        let planner = Planner::new(options.planner.clone(), Arc::clone(&schema));
        Self {
            store,
            schema,
            planner,
            options,
        }
    }

    /// Opens the configured store and schema.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let schema = FieldSchema::load(config.engine.schema_path.as_deref())?;
        let store = crate::store::open(&config.store)?;
        tracing::info!(store = %store.describe(), fields = schema.len(), "coordinator ready");
        Ok(Self::new(store, Arc::new(schema), CoordinatorOptions::from(config)))
    }

    /// Store being queried.
    pub fn store(&self) -> &dyn RemoteStore {
        self.store.as_ref()
    }

    /// Field schema in use.
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Validates and plans a request. Every client error surfaces here,
    /// before any store work.
    pub fn prepare(&self, request: &QueryRequest) -> std::result::Result<QueryPlan, QueryError> {
        self.planner.plan(request)
    }

    /// Explain tree of a request.
    pub fn explain(&self, request: &QueryRequest) -> std::result::Result<PlanExplain, QueryError> {
        self.prepare(request).map(|plan| explain(&plan))
    }

    /// Runs `plan` under the query deadline and emits the terminal `data`
    /// frame. Errors are returned, not emitted.
    pub async fn run(&self, plan: QueryPlan, sink: &EventSink) -> Result<usize> {
        let timeout = self.options.query_timeout;
        let profiles = match tokio::time::timeout(timeout, self.execute(plan, sink)).await {
            Ok(result) => result?,
            Err(_) => return Err(CohortError::Timeout(timeout)),
        };
        let count = profiles.len();
        sink.emit(QueryEvent::Data { data: profiles }).await?;
        Ok(count)
    }

    /// Spawns `plan` and returns its frame stream. Failures become a
    /// terminal `error` frame.
    pub fn stream(self: &Arc<Self>, plan: QueryPlan) -> QueryStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancelFlag::default();
        let sink = EventSink::new(tx, cancel.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run(plan, &sink).await {
                Ok(_) => {}
                Err(CohortError::Cancelled) => tracing::info!("query cancelled"),
                Err(err) => {
                    tracing::warn!(error = %err, status = err.http_status(), "query failed");
                    sink.finish(QueryEvent::error(&err)).await;
                }
            }
        });
        QueryStream { events: rx, cancel }
    }

    async fn execute(&self, plan: QueryPlan, sink: &EventSink) -> Result<Vec<EntityProfile>> {
        let started = Instant::now();
        let fingerprint = format!("{:016x}", plan.fingerprint);
        tracing::info!(
            fingerprint = %fingerprint,
            query = %plan.display,
            strategy = plan.strategy.name(),
            "query started"
        );

        let snapshots = self.fetch_snapshots(&plan.required, sink).await?;
        sink.check()?;

        let ctx = EvalContext {
            snapshots: &snapshots,
            cutoff: self.options.cutoff,
            subregion_prefix_len: self.options.subregion_prefix_len,
        };
        let matched = match &plan.strategy {
            Strategy::SingleTree(query) => evaluate(query, ctx),
            Strategy::GroupedIntersection(groups) => {
                sink.emit(QueryEvent::Mode {
                    mode: plan.strategy.name().to_owned(),
                    groups: groups.len(),
                })
                .await?;
                let mut acc: Option<CandidateSet> = None;
                for group in groups {
                    sink.emit(QueryEvent::Group {
                        group: group.index,
                        query: group.display.clone(),
                    })
                    .await?;
                    let found = evaluate(&group.query, ctx);
                    acc = Some(match acc {
                        Some(prev) => prev.intersect_by_key(found),
                        None => found,
                    });
                }
                acc.unwrap_or_default()
            }
        };
        let candidates = matched.into_sorted_vec();
        tracing::info!(fingerprint = %fingerprint, candidates = candidates.len(), "evaluation finished");

        let details = self
            .fetch_details(&candidates, &plan.detail_categories(), sink)
            .await?;
        let profiles = self.materialize(candidates, details, &snapshots, plan.date_scope);
        tracing::info!(
            fingerprint = %fingerprint,
            results = profiles.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query finished"
        );
        Ok(profiles)
    }

    /// Fetches every category concurrently. Any failure is fatal.
    async fn fetch_snapshots(
        &self,
        required: &[NodeCategory],
        sink: &EventSink,
    ) -> Result<Snapshots> {
        let mut pending: FuturesUnordered<_> = required
            .iter()
            .map(|category| {
                let store = Arc::clone(&self.store);
                let category = *category;
                async move {
                    let start = profile_timer();
                    let result = fetch_snapshot(store.as_ref(), category).await;
                    record_profile_timer(QueryProfileKind::SnapshotFetch, start);
                    (category, result)
                }
            })
            .collect();
        let mut snapshots = Snapshots::new();
        while let Some((category, result)) = pending.next().await {
            let snapshot = result.map_err(|err| {
                tracing::error!(node = %category, error = %err, "snapshot fetch failed");
                err
            })?;
            tracing::debug!(node = %category, entities = snapshot.len(), "snapshot fetched");
            snapshots.insert(category, snapshot);
            sink.emit(QueryEvent::Fetching { fetching: category }).await?;
        }
        Ok(snapshots)
    }

    /// Fetches `categories` for each candidate in waves of `batch_size`. A
    /// wave completes fully before the next starts; failed reads become `null`.
    async fn fetch_details(
        &self,
        candidates: &[Candidate],
        categories: &[NodeCategory],
        sink: &EventSink,
    ) -> Result<Vec<BTreeMap<NodeCategory, Value>>> {
        let mut details = vec![BTreeMap::new(); candidates.len()];
        if categories.is_empty() || candidates.is_empty() {
            return Ok(details);
        }
        let batch_size = self.options.batch_size.max(1);
        let mut processed = 0usize;
        for (wave, chunk) in candidates.chunks(batch_size).enumerate() {
            sink.check()?;
            let offset = wave * batch_size;
            let mut pending: FuturesUnordered<_> = chunk
                .iter()
                .enumerate()
                .map(|(i, candidate)| {
                    let store = Arc::clone(&self.store);
                    let key = candidate.key.clone();
                    async move {
                        let start = profile_timer();
                        let nodes = fetch_entity(store.as_ref(), &key, categories).await;
                        record_profile_timer(QueryProfileKind::DetailFetch, start);
                        (offset + i, nodes)
                    }
                })
                .collect();
            while let Some((slot, nodes)) = pending.next().await {
                details[slot] = nodes;
                processed += 1;
                sink.emit(QueryEvent::Processed { processed }).await?;
            }
            tracing::debug!(wave, size = chunk.len(), "detail wave complete");
        }
        Ok(details)
    }

    fn materialize(
        &self,
        candidates: Vec<Candidate>,
        details: Vec<BTreeMap<NodeCategory, Value>>,
        snapshots: &Snapshots,
        date_scope: Option<(i64, i64)>,
    ) -> Vec<EntityProfile> {
        let cutoff = self.options.cutoff;
        candidates
            .into_iter()
            .zip(details)
            .map(|(candidate, mut fetched)| {
                let mode = match (date_scope, candidate.tag.phase()) {
                    (Some((lo, hi)), _) => PhaseMode::DateRange { lo, hi },
                    (None, Some(phase)) => PhaseMode::PhaseOnly(phase),
                    (None, None) => PhaseMode::Unscoped,
                };
                let nodes = NodeCategory::ALL
                    .into_iter()
                    .map(|category| {
                        let raw = match snapshots.get(category) {
                            Some(snapshot) => snapshot.get(&candidate.key).cloned(),
                            None => fetched.remove(&category),
                        }
                        .unwrap_or(Value::Null);
                        let value = if category.is_timestamped() && raw.is_object() {
                            temporal::project(&raw, mode, &cutoff).to_raw()
                        } else {
                            raw
                        };
                        (category, value)
                    })
                    .collect();
                EntityProfile {
                    key: candidate.key,
                    phase: candidate.tag,
                    nodes,
                }
            })
            .collect()
    }
}

async fn fetch_entity(
    store: &dyn RemoteStore,
    key: &EntityKey,
    categories: &[NodeCategory],
) -> BTreeMap<NodeCategory, Value> {
    let mut nodes = BTreeMap::new();
    for category in categories {
        let path = StorePath::entity(*category, key);
        let value = match store.get_subtree(&path).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "entity fetch failed; using null");
                Value::Null
            }
        };
        nodes.insert(*category, value);
    }
    nodes
}
