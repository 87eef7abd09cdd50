//! Typed loaders for the upstream mining artifacts.
//!
//! All JSON inputs keep their object key order, so everything derived from
//! them is emitted in file order.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use clearkg_shared::{ClearKgError, Result};

use crate::artifacts::read_json;

/// Static-attribute fields that identify a knowledge unit rather than describe it.
pub const IDENTIFIER_FIELDS: [&str; 3] = ["MMSI", "seq", "block"];

// ---------------------------------------------------------------------------
// Join key
// ---------------------------------------------------------------------------

/// `(mmsi, sequence_id, segment_id)`: correlates knowledge units, imputation
/// records and raw point rows for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinKey {
    pub mmsi: i64,
    pub sequence_id: i64,
    pub segment_id: i64,
}

impl JoinKey {
    pub fn new(mmsi: i64, sequence_id: i64, segment_id: i64) -> Self {
        Self {
            mmsi,
            sequence_id,
            segment_id,
        }
    }

    /// The same trajectory, `offset` segments away.
    pub fn shifted(&self, offset: i64) -> Self {
        Self {
            segment_id: self.segment_id + offset,
            ..*self
        }
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Integer view of a JSON value; numeric strings and whole floats are accepted.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Whether a value counts as present (non-null, non-zero, non-empty).
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Plain-text rendering that matches the exporting side's `str()`:
/// strings unquoted, `True`/`False`, `None`, everything else as JSON.
///
/// Attribute keys (`vs_{field}_{value}`) are built from this, so it must
/// agree with how the SDKG tables spell non-string values.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Null => "None".into(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// SDKG tables
// ---------------------------------------------------------------------------

/// `{id: {key: weight}}` edge table, in file order.
pub type WeightTable = Vec<(String, Vec<(String, f64)>)>;

/// One entry of the function-node table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionSpec {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// The five SDKG source tables.
#[derive(Debug, Clone, Default)]
pub struct SdkgTables {
    /// Behavior id → attribute key (`vs_{category}_{name}`) → weight.
    pub behavior_graph: WeightTable,
    /// Behavior id → behavior fields (speed_profile, course_change, ...).
    pub behavior_nodes: Vec<(String, Map<String, Value>)>,
    /// Function id → behavior id → weight.
    pub function_graph: WeightTable,
    pub function_nodes: Vec<(String, FunctionSpec)>,
    /// Category → name → number of incident behaviors.
    pub attribute_graph: Vec<(String, Vec<(String, usize)>)>,
}

/// Read a `{"<root_key>": {...}}` wrapper and return the inner object.
fn load_wrapped(path: &Path, root_key: &str) -> Result<Map<String, Value>> {
    let mut doc: Map<String, Value> = read_json(path)?;
    match doc.remove(root_key) {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ClearKgError::parse(format!(
            "{}: `{root_key}` is not an object",
            path.display()
        ))),
        None => Err(ClearKgError::parse(format!(
            "{}: missing `{root_key}`",
            path.display()
        ))),
    }
}

fn as_object(value: Value, path: &Path, id: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ClearKgError::parse(format!(
            "{}: entry `{id}` is not an object",
            path.display()
        ))),
    }
}

fn weight_table(path: &Path, root_key: &str) -> Result<WeightTable> {
    load_wrapped(path, root_key)?
        .into_iter()
        .map(|(id, value)| {
            let weights = as_object(value, path, &id)?
                .into_iter()
                .map(|(key, w)| match w.as_f64() {
                    Some(w) => Ok((key, w)),
                    None => Err(ClearKgError::parse(format!(
                        "{}: weight {id}/{key} is not a number",
                        path.display()
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((id, weights))
        })
        .collect()
}

pub fn load_behavior_graph(path: &Path) -> Result<WeightTable> {
    weight_table(path, "SDK_graph_vb")
}

pub fn load_behavior_nodes(path: &Path) -> Result<Vec<(String, Map<String, Value>)>> {
    load_wrapped(path, "SDK_graph_vb_node")?
        .into_iter()
        .map(|(id, value)| {
            let fields = as_object(value, path, &id)?;
            Ok((id, fields))
        })
        .collect()
}

pub fn load_function_graph(path: &Path) -> Result<WeightTable> {
    weight_table(path, "SDK_graph_vf")
}

pub fn load_function_nodes(path: &Path) -> Result<Vec<(String, FunctionSpec)>> {
    load_wrapped(path, "SDK_graph_vf_node")?
        .into_iter()
        .map(|(id, value)| {
            let spec: FunctionSpec = serde_json::from_value(value).map_err(|e| {
                ClearKgError::parse(format!("{}: function `{id}`: {e}", path.display()))
            })?;
            Ok((id, spec))
        })
        .collect()
}

/// Incidences may be listed as an array or an object; only the count is kept.
pub fn load_attribute_graph(path: &Path) -> Result<Vec<(String, Vec<(String, usize)>)>> {
    load_wrapped(path, "SDK_graph_vs")?
        .into_iter()
        .map(|(category, value)| {
            let names = as_object(value, path, &category)?
                .into_iter()
                .map(|(name, incident)| match incident {
                    Value::Array(a) => Ok((name, a.len())),
                    Value::Object(o) => Ok((name, o.len())),
                    _ => Err(ClearKgError::parse(format!(
                        "{}: incidence {category}/{name} is not a collection",
                        path.display()
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((category, names))
        })
        .collect()
}

impl SdkgTables {
    /// Load all five tables. Any missing file fails the load.
    pub fn load(
        behavior_graph: &Path,
        behavior_nodes: &Path,
        function_graph: &Path,
        function_nodes: &Path,
        attribute_graph: &Path,
    ) -> Result<Self> {
        Ok(Self {
            behavior_graph: load_behavior_graph(behavior_graph)?,
            behavior_nodes: load_behavior_nodes(behavior_nodes)?,
            function_graph: load_function_graph(function_graph)?,
            function_nodes: load_function_nodes(function_nodes)?,
            attribute_graph: load_attribute_graph(attribute_graph)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Knowledge units
// ---------------------------------------------------------------------------

/// A per-segment record of static attributes (`v_s`), behavior context
/// (`v_b`) and behavior function (`v_f`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeUnit {
    pub static_fields: Map<String, Value>,
    pub behavior: Map<String, Value>,
    pub function: Map<String, Value>,
}

impl KnowledgeUnit {
    /// `(mmsi, seq)` when both parse as integers.
    pub fn trajectory_key(&self) -> Option<(i64, i64)> {
        let mmsi = self.static_fields.get("MMSI").and_then(value_as_i64)?;
        let seq = self.static_fields.get("seq").and_then(value_as_i64)?;
        Some((mmsi, seq))
    }

    /// Full join key when `MMSI`, `seq` and `block` all parse.
    pub fn join_key(&self) -> Option<JoinKey> {
        let (mmsi, seq) = self.trajectory_key()?;
        let block = self.static_fields.get("block").and_then(value_as_i64)?;
        Some(JoinKey::new(mmsi, seq, block))
    }

    /// Static fields other than the identifiers, in record order.
    pub fn descriptive_fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.static_fields
            .iter()
            .filter(|(k, _)| !IDENTIFIER_FIELDS.contains(&k.as_str()))
    }

    /// The `spatial_function` code, if present and non-empty.
    pub fn spatial_function(&self) -> Option<&str> {
        self.function
            .get("spatial_function")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

fn object_field(entry: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match entry.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Load the knowledge-unit list. Null entries and entries without `v_s` are
/// skipped.
pub fn load_knowledge_units(path: &Path) -> Result<Vec<KnowledgeUnit>> {
    let raw: Vec<Value> = read_json(path)?;
    let total = raw.len();
    let units: Vec<KnowledgeUnit> = raw
        .into_iter()
        .filter_map(|entry| match entry {
            Value::Object(mut map) => match map.remove("v_s") {
                Some(Value::Object(static_fields)) => Some(KnowledgeUnit {
                    static_fields,
                    behavior: object_field(&mut map, "v_b"),
                    function: object_field(&mut map, "v_f"),
                }),
                _ => None,
            },
            _ => None,
        })
        .collect();
    debug!(total, kept = units.len(), "loaded knowledge units");
    Ok(units)
}

/// `(mmsi, seq)` pairs named by the knowledge units.
pub fn trajectory_pairs(units: &[KnowledgeUnit]) -> HashSet<(i64, i64)> {
    units.iter().filter_map(KnowledgeUnit::trajectory_key).collect()
}

/// Join-key lookup over knowledge units. Later duplicates win.
#[derive(Debug, Default)]
pub struct KnowledgeIndex<'a> {
    by_key: HashMap<JoinKey, &'a KnowledgeUnit>,
}

impl<'a> KnowledgeIndex<'a> {
    pub fn new(units: &'a [KnowledgeUnit]) -> Self {
        let by_key = units.iter().filter_map(|u| Some((u.join_key()?, u))).collect();
        Self { by_key }
    }

    pub fn get(&self, key: &JoinKey) -> Option<&'a KnowledgeUnit> {
        self.by_key.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Imputation results
// ---------------------------------------------------------------------------

/// One imputation record, keyed by join key.
#[derive(Debug, Clone, PartialEq)]
pub struct ImputationRecord {
    pub key: JoinKey,
    pub behavior_estimator: Option<Map<String, Value>>,
    pub method_selector: Option<Map<String, Value>>,
    pub explanation_composer: Option<Map<String, Value>>,
}

/// Only non-empty object blocks count as present.
fn present_block(entry: &Map<String, Value>, key: &str) -> Option<Map<String, Value>> {
    match entry.get(key) {
        Some(Value::Object(map)) if !map.is_empty() => Some(map.clone()),
        _ => None,
    }
}

/// Load imputation results. Entries lacking any join-key field are skipped.
pub fn load_imputations(path: &Path) -> Result<Vec<ImputationRecord>> {
    let raw: Vec<Value> = read_json(path)?;
    let records: Vec<ImputationRecord> = raw
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|entry| {
            let key = JoinKey::new(
                entry.get("mmsi").and_then(value_as_i64)?,
                entry.get("sequence_id").and_then(value_as_i64)?,
                entry.get("segment_id").and_then(value_as_i64)?,
            );
            Some(ImputationRecord {
                key,
                behavior_estimator: present_block(entry, "behavior_estimator"),
                method_selector: present_block(entry, "method_selector"),
                explanation_composer: present_block(entry, "explanation_composer"),
            })
        })
        .collect();
    debug!(total = raw.len(), kept = records.len(), "loaded imputation records");
    Ok(records)
}

// ---------------------------------------------------------------------------
// Raw points
// ---------------------------------------------------------------------------

/// One row of the raw point table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PointRow {
    pub mmsi: i64,
    pub sequence_id: i64,
    pub segment_id: i64,
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub sog: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub cog: Option<f64>,
    #[serde(default)]
    pub ship_type: Option<String>,
}

impl PointRow {
    pub fn trajectory_key(&self) -> (i64, i64) {
        (self.mmsi, self.sequence_id)
    }
}

/// NaN is how exported tables spell a missing reading.
fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|f| f.is_finite())
}

/// Read the CSV point table (header row required).
pub fn load_points(path: &Path) -> Result<Vec<PointRow>> {
    if !path.exists() {
        return Err(ClearKgError::missing(path));
    }
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| ClearKgError::parse(format!("{}: {e}", path.display())))?;

    let mut rows = Vec::new();
    for record in reader.deserialize::<PointRow>() {
        let mut row =
            record.map_err(|e| ClearKgError::parse(format!("{}: {e}", path.display())))?;
        row.sog = finite(row.sog);
        row.cog = finite(row.cog);
        row.ship_type = row.ship_type.filter(|s| !s.is_empty());
        rows.push(row);
    }
    debug!(path = %path.display(), rows = rows.len(), "loaded point table");
    Ok(rows)
}
