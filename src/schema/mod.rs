//! Declarative field schema consulted by the predicate evaluator.
//!
//! The schema maps human-readable field labels (as emitted by the client's
//! selector builder) to the node category and storage path they live at, the
//! comparator used to test them and an optional label-to-code map. It is a
//! data asset: the built-in table ships in `config/fields.toml` and can be
//! replaced wholesale through the `schema_path` config setting.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::NodeCategory;

/// Predicate evaluation over projected records.
pub mod predicate;

const BUILTIN_FIELDS: &str = include_str!("../../config/fields.toml");

/// Comparator applied to a field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparatorKind {
    /// String equality after label-to-code remapping.
    Exact,
    /// Relational comparison against a parsed float.
    Numeric,
    /// Membership test over the truthy sub-keys of a nested object.
    Multiset,
    /// Phase coverage across a family of node categories.
    Coverage,
}

/// How a multiset selector matches the stored key set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// Every expected key is set and nothing else is.
    ExactSet,
    /// At least one expected key is set.
    #[default]
    AnyOf,
}

/// Group of node categories whose combined phase coverage a field reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageFamily {
    /// `patients1` + `Form_1`.
    Survey,
    /// `Form_3` + `manual_vital_data` + `Form_1`.
    Screening,
    /// `tcc_form` + `Form_1`.
    Tcc,
}

impl CoverageFamily {
    /// Node categories belonging to the family.
    pub fn nodes(self) -> &'static [NodeCategory] {
        match self {
            CoverageFamily::Survey => &[NodeCategory::Patients, NodeCategory::Form1],
            CoverageFamily::Screening => &[
                NodeCategory::Form3,
                NodeCategory::ManualVitals,
                NodeCategory::Form1,
            ],
            CoverageFamily::Tcc => &[NodeCategory::TccForm, NodeCategory::Form1],
        }
    }
}

/// Storage path of a field inside a record, split on `/`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parses a flat key or a `outer/inner` nested path.
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split('/')
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    /// Whether the path addresses nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks the path up inside `record`.
    pub fn resolve<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        if self.0.is_empty() {
            return None;
        }
        self.0
            .iter()
            .try_fold(record, |current, segment| current.as_object()?.get(segment))
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// One entry of the schema.
#[derive(Clone, Debug)]
pub struct FieldDef {
    /// UI label the client uses in selector tokens.
    pub label: String,
    /// Category the field is read from; `None` for coverage fields.
    pub node: Option<NodeCategory>,
    /// Location of the value inside a record.
    pub path: FieldPath,
    /// Comparator applied to the value.
    pub kind: ComparatorKind,
    /// Match policy for multiset fields.
    pub policy: MatchPolicy,
    /// Family for coverage fields.
    pub family: Option<CoverageFamily>,
    /// UI label to stored code map.
    pub values: BTreeMap<String, String>,
}

impl FieldDef {
    /// Maps a UI label to its stored code, falling back to the label itself.
    pub fn code_for<'a>(&'a self, label: &'a str) -> &'a str {
        let label = label.trim();
        if let Some(code) = self.values.get(label) {
            return code;
        }
        self.values
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(label))
            .map(|(_, code)| code.as_str())
            .unwrap_or(label)
    }

    /// Node categories the field reads from.
    pub fn nodes(&self) -> Vec<NodeCategory> {
        match (self.kind, self.family) {
            (ComparatorKind::Coverage, Some(family)) => family.nodes().to_vec(),
            _ => self.node.into_iter().collect(),
        }
    }
}

/// Errors raised while loading a schema asset.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schema file could not be read.
    #[error("failed to read field schema {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The schema is not valid TOML for this layout.
    #[error("failed to parse field schema: {0}")]
    Parse(#[from] toml::de::Error),
    /// Two entries share a label.
    #[error("field '{label}' is defined more than once")]
    DuplicateField {
        /// Offending label.
        label: String,
    },
    /// A record field omitted its node or path.
    #[error("field '{label}' must declare a node and a path")]
    MissingLocation {
        /// Offending label.
        label: String,
    },
    /// A coverage field omitted its family.
    #[error("coverage field '{label}' must declare a family")]
    MissingFamily {
        /// Offending label.
        label: String,
    },
}

/// Label-indexed field table.
#[derive(Clone, Debug, Default)]
pub struct FieldSchema {
    fields: HashMap<String, FieldDef>,
}

impl FieldSchema {
    /// The schema embedded in the binary.
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::from_toml_str(BUILTIN_FIELDS)
    }

    /// Loads a schema from `path`, or the built-in one when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, SchemaError> {
        let Some(path) = path else {
            return Self::builtin();
        };
        let contents = fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let schema = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), fields = schema.len(), "loaded field schema");
        Ok(schema)
    }

    /// Parses a schema from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, SchemaError> {
        let raw: RawSchema = toml::from_str(contents)?;
        let mut fields = HashMap::with_capacity(raw.field.len());
        for entry in raw.field {
            let def = convert_field(entry)?;
            let key = normalize_label(&def.label);
            if fields.contains_key(&key) {
                return Err(SchemaError::DuplicateField { label: def.label });
            }
            fields.insert(key, def);
        }
        Ok(Self { fields })
    }

    /// Looks a field up by label, ignoring case and surrounding whitespace.
    pub fn get(&self, label: &str) -> Option<&FieldDef> {
        self.fields.get(&normalize_label(label))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields sorted by label.
    pub fn fields(&self) -> Vec<&FieldDef> {
        let mut defs: Vec<_> = self.fields.values().collect();
        defs.sort_by(|a, b| a.label.cmp(&b.label));
        defs
    }
}

fn normalize_label(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

fn convert_field(raw: RawField) -> Result<FieldDef, SchemaError> {
    let path = raw.path.as_deref().map(FieldPath::parse).unwrap_or_default();
    match raw.kind {
        ComparatorKind::Coverage => {
            if raw.family.is_none() {
                return Err(SchemaError::MissingFamily { label: raw.label });
            }
        }
        _ => {
            if raw.node.is_none() || path.is_empty() {
                return Err(SchemaError::MissingLocation { label: raw.label });
            }
        }
    }
    Ok(FieldDef {
        label: raw.label,
        node: raw.node,
        path,
        kind: raw.kind,
        policy: raw.policy.unwrap_or_default(),
        family: raw.family,
        values: raw.values,
    })
}

#[derive(Debug, Deserialize)]
struct RawSchema {
    #[serde(default)]
    field: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    label: String,
    node: Option<NodeCategory>,
    path: Option<String>,
    kind: ComparatorKind,
    policy: Option<MatchPolicy>,
    family: Option<CoverageFamily>,
    #[serde(default)]
    values: BTreeMap<String, String>,
}
