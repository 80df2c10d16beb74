//! Read-only access to the hierarchical remote store.
//!
//! Data lives at `category/region/subregion/entity[/timestamp]`. The engine
//! only ever issues "get subtree" reads: one per category for the snapshots
//! scanned during evaluation, and one per `(category, entity)` for detail
//! fetches. [`RemoteStore`] abstracts the transport; [`http::HttpStore`]
//! speaks the Firebase REST convention and [`memory::MemoryStore`] serves a
//! JSON fixture.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::model::{EntityKey, NodeCategory};
use crate::query::scope::PartitionScope;

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

/// Errors raised while reading the remote store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store answered with a non-success status.
    #[error("store returned HTTP {status} for {path}")]
    Http {
        /// Path requested.
        path: String,
        /// Response status code.
        status: u16,
    },
    /// The request never completed.
    #[error("request for {path} failed: {source}")]
    Transport {
        /// Path requested.
        path: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The response body was not the JSON we expected.
    #[error("malformed payload at {path}: {message}")]
    Decode {
        /// Path requested.
        path: String,
        /// What was wrong.
        message: String,
    },
    /// The store refused or could not serve the path.
    #[error("store unavailable for {path}")]
    Unavailable {
        /// Path requested.
        path: String,
    },
    /// A fixture file could not be read.
    #[error("failed to read fixture {path}: {source}")]
    Fixture {
        /// Fixture file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The configured base URL cannot address store paths.
    #[error("invalid store URL {url}: {message}")]
    InvalidUrl {
        /// URL as configured.
        url: String,
        /// Why it was rejected.
        message: String,
    },
    /// Neither a base URL nor a fixture was configured.
    #[error("no store configured: set [store].base_url or [store].fixture")]
    NotConfigured,
}

/// Convenience alias for store results.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Hierarchical store path.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct StorePath(Vec<String>);

impl StorePath {
    /// Path of a whole category.
    pub fn category(category: NodeCategory) -> Self {
        Self(vec![category.as_str().to_owned()])
    }

    /// Path of one entity inside a category.
    pub fn entity(category: NodeCategory, key: &EntityKey) -> Self {
        Self(vec![
            category.as_str().to_owned(),
            key.region.clone(),
            key.subregion.clone(),
            key.id.clone(),
        ])
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Transport for subtree reads.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads the subtree at `path`. A missing path reads as `Value::Null`.
    async fn get_subtree(&self, path: &StorePath) -> StoreResult<Value>;

    /// Short description used in logs.
    fn describe(&self) -> String;
}

/// Opens the store described by `config`. A fixture wins over a base URL.
pub fn open(config: &StoreConfig) -> StoreResult<Arc<dyn RemoteStore>> {
    if let Some(fixture) = &config.fixture {
        return Ok(Arc::new(MemoryStore::from_path(fixture)?));
    }
    if let Some(base_url) = &config.base_url {
        return Ok(Arc::new(HttpStore::new(
            base_url,
            config.auth_token.clone(),
            config.request_timeout(),
        )?));
    }
    Err(StoreError::NotConfigured)
}

/// Fetches and indexes the full snapshot of one category.
pub async fn fetch_snapshot(
    store: &dyn RemoteStore,
    category: NodeCategory,
) -> StoreResult<NodeSnapshot> {
    let raw = store.get_subtree(&StorePath::category(category)).await?;
    NodeSnapshot::from_value(category, raw)
}

type EntityMap = BTreeMap<String, Value>;
type SubregionMap = BTreeMap<String, EntityMap>;

/// Full contents of one category, indexed `region -> subregion -> entity`.
#[derive(Clone, Debug, Default)]
pub struct NodeSnapshot {
    category: Option<NodeCategory>,
    partitions: BTreeMap<String, SubregionMap>,
    len: usize,
}

impl NodeSnapshot {
    /// Indexes a raw category subtree. `null` reads as an empty snapshot;
    /// non-object levels below the root are skipped.
    pub fn from_value(category: NodeCategory, raw: Value) -> StoreResult<Self> {
        let regions = match raw {
            Value::Null => return Ok(Self::empty(category)),
            Value::Object(regions) => regions,
            other => {
                return Err(StoreError::Decode {
                    path: category.as_str().to_owned(),
                    message: format!("expected an object, found {}", kind_of(&other)),
                })
            }
        };
        let mut partitions = BTreeMap::new();
        let mut len = 0usize;
        let mut skipped = 0usize;
        for (region, subregions) in regions {
            let Value::Object(subregions) = subregions else {
                skipped += 1;
                continue;
            };
            let mut by_subregion = SubregionMap::new();
            for (subregion, entities) in subregions {
                let Value::Object(entities) = entities else {
                    skipped += 1;
                    continue;
                };
                let entities: EntityMap = entities.into_iter().collect();
                len += entities.len();
                by_subregion.insert(subregion, entities);
            }
            partitions.insert(region, by_subregion);
        }
        if skipped > 0 {
            tracing::warn!(category = %category, skipped, "skipped malformed partitions");
        }
        Ok(Self {
            category: Some(category),
            partitions,
            len,
        })
    }

    /// Snapshot with no entities.
    pub fn empty(category: NodeCategory) -> Self {
        Self {
            category: Some(category),
            ..Self::default()
        }
    }

    /// Category the snapshot was read from.
    pub fn category(&self) -> Option<NodeCategory> {
        self.category
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the snapshot holds no entity.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw data of one entity.
    pub fn get(&self, key: &EntityKey) -> Option<&Value> {
        self.partitions
            .get(&key.region)?
            .get(&key.subregion)?
            .get(&key.id)
    }

    /// Entities inside `scope`, in key order.
    ///
    /// A region derived from a subregion prefix is used as a lookup hint; if
    /// the hinted region is absent every region is searched for the subregion.
    pub fn scan<'a>(&'a self, scope: &PartitionScope) -> Vec<(EntityKey, &'a Value)> {
        let regions: Vec<(&String, &SubregionMap)> = match (&scope.region, &scope.subregion) {
            (Some(region), subregion) => match self.partitions.get_key_value(region) {
                Some(found) => vec![found],
                None if subregion.is_some() => self.partitions.iter().collect(),
                None => Vec::new(),
            },
            (None, _) => self.partitions.iter().collect(),
        };
        let mut out = Vec::new();
        for (region, subregions) in regions {
            for (subregion, entities) in subregions {
                if scope
                    .subregion
                    .as_ref()
                    .is_some_and(|wanted| wanted != subregion)
                {
                    continue;
                }
                out.extend(
                    entities
                        .iter()
                        .map(|(id, value)| (EntityKey::new(region, subregion, id), value)),
                );
            }
        }
        out
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Category snapshots fetched for one query.
#[derive(Clone, Debug, Default)]
pub struct Snapshots {
    by_category: HashMap<NodeCategory, NodeSnapshot>,
}

impl Snapshots {
    /// No snapshots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a snapshot.
    pub fn insert(&mut self, category: NodeCategory, snapshot: NodeSnapshot) {
        self.by_category.insert(category, snapshot);
    }

    /// Snapshot of `category`, if fetched.
    pub fn get(&self, category: NodeCategory) -> Option<&NodeSnapshot> {
        self.by_category.get(&category)
    }

    /// Whether `category` was fetched.
    pub fn contains(&self, category: NodeCategory) -> bool {
        self.by_category.contains_key(&category)
    }

    /// Fetched categories in store order.
    pub fn categories(&self) -> Vec<NodeCategory> {
        NodeCategory::ALL
            .into_iter()
            .filter(|category| self.contains(*category))
            .collect()
    }

    /// Every snapshot.
    pub fn iter(&self) -> impl Iterator<Item = (NodeCategory, &NodeSnapshot)> {
        self.by_category.iter().map(|(category, snap)| (*category, snap))
    }
}

impl FromIterator<(NodeCategory, NodeSnapshot)> for Snapshots {
    fn from_iter<I: IntoIterator<Item = (NodeCategory, NodeSnapshot)>>(iter: I) -> Self {
        Self {
            by_category: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> NodeSnapshot {
        NodeSnapshot::from_value(
            NodeCategory::Patients,
            json!({
                "032": {
                    "03217": { "e1": { "age": 50 }, "e2": { "age": 60 } },
                    "03218": { "e3": { "age": 30 } },
                },
                "041": { "04101": { "e4": { "age": 70 } }, "bad": 5 },
            }),
        )
        .expect("indexes")
    }

    #[test]
    fn indexes_entities_by_partition() {
        let snap = snapshot();
        assert_eq!(snap.len(), 4);
        assert_eq!(
            snap.get(&EntityKey::new("032", "03218", "e3")),
            Some(&json!({ "age": 30 }))
        );
        assert!(snap.get(&EntityKey::new("032", "03218", "e9")).is_none());
    }

    #[test]
    fn scan_restricts_partitions() {
        let snap = snapshot();
        assert_eq!(snap.scan(&PartitionScope::default()).len(), 4);
        assert_eq!(snap.scan(&PartitionScope::region("032")).len(), 3);
        let village = snap.scan(&PartitionScope::subregion("03217", 3));
        let ids: Vec<_> = village.iter().map(|(key, _)| key.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert!(snap.scan(&PartitionScope::region("999")).is_empty());
    }

    #[test]
    fn subregion_hint_falls_back_to_full_search() {
        let snap = snapshot();
        let scope = PartitionScope {
            region: Some("xyz".into()),
            subregion: Some("04101".into()),
        };
        assert_eq!(snap.scan(&scope).len(), 1);
    }

    #[test]
    fn null_reads_as_empty_and_scalars_are_rejected() {
        assert!(NodeSnapshot::from_value(NodeCategory::Form3, Value::Null)
            .unwrap()
            .is_empty());
        assert!(matches!(
            NodeSnapshot::from_value(NodeCategory::Form3, json!(3)),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn paths_render_with_slashes() {
        let key = EntityKey::new("032", "03217", "e1");
        assert_eq!(
            StorePath::entity(NodeCategory::Form1, &key).to_string(),
            "Form_1/032/03217/e1"
        );
        assert_eq!(StorePath::category(NodeCategory::TccForm).to_string(), "tcc_form");
    }
}
