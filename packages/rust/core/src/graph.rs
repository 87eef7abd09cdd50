//! Graph Assembler: joins the SDKG tables, knowledge units, imputation
//! results and raw points into one typed node/link graph.
//!
//! Nodes live in an arena (`Vec<Node>` plus an id → slot map); links are an
//! append-only list. Construction order is fixed:
//!
//! 1. behavior nodes (deduplicated by [`PatternKey`])
//! 2. function nodes
//! 3. attribute nodes
//! 4. trajectory and segment nodes, with `part_of` links
//! 5. segment → behavior / attribute / function links from knowledge units
//! 6. function → behavior `implements` links
//! 7. behavior → attribute `has_attribute` links
//!
//! Outputs are `nodes/<id>.json` per node and `sdkg_index.json`.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use clearkg_shared::{
    BehaviorEstimator, ClearKgError, DatasetInputs, ExplanationComposer, GraphIndex, Link,
    MethodSelector, Node, NodeKind, RelatedNode, Result, SegmentContext, SegmentDetail,
};

use crate::artifacts::{OutputLayout, check_file_id, is_file_safe_id, write_json};
use crate::inputs::{
    self, ImputationRecord, JoinKey, KnowledgeIndex, KnowledgeUnit, PointRow, SdkgTables,
    display_value, is_truthy,
};
use crate::pipeline::{ProgressReporter, StageReport};

pub const PART_OF: &str = "part_of";
pub const EXHIBITS_BEHAVIOR: &str = "exhibits_behavior";
pub const HAS_ATTRIBUTE: &str = "has_attribute";
pub const USES_FUNCTION: &str = "uses_function";
pub const IMPLEMENTS: &str = "implements";

/// Narrative field excluded from behavior context blocks.
const NARRATIVE_FIELD: &str = "llm_output";

const PATTERN_FIELDS: [&str; 5] = [
    "speed_profile",
    "course_change",
    "heading_fluctuation",
    "intent",
    "duration",
];

// ---------------------------------------------------------------------------
// Pattern key
// ---------------------------------------------------------------------------

/// Canonical identity of a behavior: its five descriptive fields, each cut
/// at the first `(` and trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternKey([String; 5]);

impl PatternKey {
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        Self(PATTERN_FIELDS.map(|f| fields.get(f).map(main_description).unwrap_or_default()))
    }

    pub fn parts(&self) -> &[String; 5] {
        &self.0
    }
}

/// Text preceding the first parenthesis, trimmed. Non-strings are rendered
/// as-is.
pub fn main_description(value: &Value) -> String {
    let Value::String(text) = value else {
        return display_value(value);
    };
    match text.find('(') {
        Some(pos) => text[..pos].trim().to_string(),
        None => text.trim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Options, sources, results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Drop exact duplicate `(source, target, relation)` links.
    pub dedupe_links: bool,
    /// Cap on `related` entries per node.
    pub max_related: usize,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            dedupe_links: false,
            max_related: 20,
        }
    }
}

/// Everything the assembler joins.
#[derive(Debug, Clone, Default)]
pub struct GraphSources {
    pub tables: SdkgTables,
    pub units: Vec<KnowledgeUnit>,
    pub imputations: Vec<ImputationRecord>,
    pub points: Vec<PointRow>,
}

/// Node and link counts of an assembled graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub nodes_by_type: BTreeMap<String, usize>,
    pub links_by_relation: BTreeMap<String, usize>,
    pub total_nodes: usize,
    pub total_links: usize,
}

impl GraphStats {
    fn collect(nodes: &[Node], links: &[Link]) -> Self {
        let mut stats = Self {
            total_nodes: nodes.len(),
            total_links: links.len(),
            ..Default::default()
        };
        for node in nodes {
            *stats
                .nodes_by_type
                .entry(node.node_type().to_string())
                .or_default() += 1;
        }
        for link in links {
            *stats
                .links_by_relation
                .entry(link.relation.clone())
                .or_default() += 1;
        }
        stats
    }
}

/// The assembled graph, nodes in construction order.
#[derive(Debug, Clone)]
pub struct AssembledGraph {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub stats: GraphStats,
}

impl AssembledGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn index(&self) -> GraphIndex {
        GraphIndex {
            nodes: self.nodes.iter().map(Node::to_index).collect(),
            links: self.links.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<Node>,
    slots: HashMap<String, usize>,
    links: Vec<Link>,
    /// Pattern key → canonical behavior node id.
    patterns: HashMap<PatternKey, String>,
    /// Source behavior id → canonical behavior node id (aliases included).
    behavior_ids: HashMap<String, String>,
    /// Function code → function node id.
    function_codes: HashMap<String, String>,
    /// `vs_{category}_{name}` → attribute node id.
    attribute_keys: HashMap<String, String>,
    /// Segment join key → segment node id.
    segment_keys: HashMap<JoinKey, String>,
}

impl GraphBuilder {
    /// Insert a node; an existing id is replaced in place.
    fn insert(&mut self, node: Node) {
        match self.slots.get(&node.id) {
            Some(&slot) => self.nodes[slot] = node,
            None => {
                self.slots.insert(node.id.clone(), self.nodes.len());
                self.nodes.push(node);
            }
        }
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        let slot = *self.slots.get(id)?;
        self.nodes.get_mut(slot)
    }

    fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    fn link(&mut self, source: &str, target: &str, relation: &str) {
        self.links.push(Link::new(source, target, relation));
    }

    // -- 1. behaviors -------------------------------------------------------

    fn add_behaviors(&mut self, tables: &SdkgTables) {
        let degrees: HashMap<&str, usize> = tables
            .behavior_graph
            .iter()
            .map(|(id, attrs)| (id.as_str(), attrs.len()))
            .collect();

        for (vb_id, fields) in &tables.behavior_nodes {
            if !is_file_safe_id(vb_id) {
                warn!(vb_id = %vb_id, "behavior id is not a valid file name, skipped");
                continue;
            }
            let key = PatternKey::from_fields(fields);

            if let Some(canonical) = self.patterns.get(&key).cloned() {
                debug!(vb_id = %vb_id, canonical = %canonical, "behavior merged by pattern key");
                self.behavior_ids.insert(vb_id.clone(), canonical.clone());
                if let Some(node) = self.get_mut(&canonical) {
                    if let NodeKind::Behavior { support, .. } = &mut node.kind {
                        *support += 1;
                    }
                    if let Some(Value::Array(merged)) = node.metadata.get_mut("merged_ids") {
                        merged.push(Value::String(vb_id.clone()));
                    }
                }
                continue;
            }

            let node_id = format!("B_{vb_id}");
            self.patterns.insert(key.clone(), node_id.clone());
            self.behavior_ids.insert(vb_id.clone(), node_id.clone());

            let field = |name: &str| fields.get(name).map(display_value);
            let or_unknown = |name: &str| field(name).unwrap_or_else(|| "Unknown".into());

            let mut metadata = Map::new();
            metadata.insert("original_id".into(), json!(vb_id));
            metadata.insert(
                "duration".into(),
                fields.get("duration").cloned().unwrap_or(Value::Null),
            );
            metadata.insert("pattern_key".into(), json!(key.parts()));
            metadata.insert("merged_ids".into(), json!([vb_id]));

            self.insert(Node {
                id: node_id,
                label: format!("Behavior {}", last_chars(vb_id, 8)),
                summary: format!(
                    "Vessel behavior pattern: {}",
                    field("intent").unwrap_or_else(|| "Unknown intent".into())
                ),
                description: vec![
                    format!("Speed profile: {}", or_unknown("speed_profile")),
                    format!("Course change: {}", or_unknown("course_change")),
                    format!("Heading fluctuation: {}", or_unknown("heading_fluctuation")),
                    format!("Behavior intent: {}", or_unknown("intent")),
                    format!("Duration: {}", or_unknown("duration")),
                ],
                metadata,
                related: vec![],
                kind: NodeKind::Behavior {
                    degree: degrees.get(vb_id.as_str()).copied().unwrap_or(0),
                    support: 1,
                },
            });
        }
    }

    // -- 2. functions -------------------------------------------------------

    fn add_functions(&mut self, tables: &SdkgTables) {
        let degrees: HashMap<&str, usize> = tables
            .function_graph
            .iter()
            .map(|(id, behaviors)| (id.as_str(), behaviors.len()))
            .collect();

        for (vf_id, spec) in &tables.function_nodes {
            if !is_file_safe_id(vf_id) {
                warn!(vf_id = %vf_id, "function id is not a valid file name, skipped");
                continue;
            }
            let node_id = format!("F_{vf_id}");
            let code = spec.code.clone().unwrap_or_default();
            if !code.is_empty() {
                self.function_codes.insert(code.clone(), node_id.clone());
            }
            let description = spec.description.as_deref();

            let mut metadata = Map::new();
            metadata.insert("original_id".into(), json!(vf_id));
            metadata.insert("code".into(), json!(code));

            self.insert(Node {
                id: node_id,
                label: format!("Function {}", last_chars(vf_id, 8)),
                summary: format!("{}...", first_chars(description.unwrap_or(""), 100)),
                description: vec![
                    format!(
                        "Function description: {}",
                        description.unwrap_or("No description")
                    ),
                    format!("Code implementation: {code}"),
                ],
                metadata,
                related: vec![],
                kind: NodeKind::Function {
                    degree: degrees.get(vf_id.as_str()).copied().unwrap_or(0),
                },
            });
        }
    }

    // -- 3. attributes ------------------------------------------------------

    fn add_attributes(&mut self, tables: &SdkgTables) {
        let mut count = 0usize;
        for (category, names) in &tables.attribute_graph {
            for (name, incidence) in names {
                count += 1;
                let node_id = format!("A_{count:03}");
                self.attribute_keys
                    .insert(format!("vs_{category}_{name}"), node_id.clone());

                let mut metadata = Map::new();
                metadata.insert("category".into(), json!(category));
                metadata.insert("attribute_name".into(), json!(name));
                metadata.insert("support".into(), json!(incidence));

                self.insert(Node {
                    id: node_id,
                    label: format!("{category}: {name}"),
                    summary: format!("{category} attribute: {name}"),
                    description: vec![format!(
                        "This attribute is associated with {incidence} behavior patterns"
                    )],
                    metadata,
                    related: vec![],
                    kind: NodeKind::Attribute { degree: *incidence },
                });
            }
        }
    }

    // -- 4. trajectories and segments --------------------------------------

    fn add_trajectories(
        &mut self,
        rows: &[&PointRow],
        knowledge: &KnowledgeIndex<'_>,
        imputations: &HashMap<JoinKey, &ImputationRecord>,
    ) {
        let mut trajectories: BTreeMap<i64, Vec<&PointRow>> = BTreeMap::new();
        for &row in rows {
            trajectories.entry(row.sequence_id).or_default().push(row);
        }

        for (seq_id, traj_rows) in trajectories {
            let mmsi = traj_rows[0].mmsi;
            let mut segments: BTreeMap<i64, Vec<&PointRow>> = BTreeMap::new();
            for &row in &traj_rows {
                segments.entry(row.segment_id).or_default().push(row);
            }

            let traj_id = format!("T_{seq_id}");
            let mut metadata = Map::new();
            metadata.insert("mmsi".into(), json!(mmsi.to_string()));
            metadata.insert("num_segments".into(), json!(segments.len()));
            metadata.insert("num_points".into(), json!(traj_rows.len()));

            self.insert(Node {
                id: traj_id.clone(),
                label: format!("Trajectory {mmsi}"),
                summary: format!("Complete trajectory of vessel {mmsi}"),
                description: vec![
                    format!("MMSI: {mmsi}"),
                    format!("Contains {} segments", segments.len()),
                    format!("Total data points: {}", traj_rows.len()),
                ],
                metadata,
                related: vec![],
                kind: NodeKind::Trajectory {
                    degree: segments.len(),
                },
            });

            for (seg_id, mut seg_rows) in segments {
                seg_rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                let key = JoinKey::new(mmsi, seq_id, seg_id);
                let node = segment_node(key, &seg_rows, knowledge, imputations.get(&key).copied());
                let node_id = node.id.clone();
                self.insert(node);
                self.segment_keys.insert(key, node_id.clone());
                self.link(&node_id, &traj_id, PART_OF);
            }
        }
    }

    // -- 5. knowledge-unit links -------------------------------------------

    fn add_knowledge_links(&mut self, units: &[KnowledgeUnit]) {
        for unit in units {
            let Some(key) = unit.join_key() else {
                continue;
            };
            let Some(seg_id) = self.segment_keys.get(&key).cloned() else {
                debug!(?key, "knowledge unit has no segment node");
                continue;
            };

            if !unit.behavior.is_empty() {
                match self.patterns.get(&PatternKey::from_fields(&unit.behavior)).cloned() {
                    Some(behavior_id) => self.link(&seg_id, &behavior_id, EXHIBITS_BEHAVIOR),
                    None => debug!(segment = %seg_id, "no behavior matches pattern key"),
                }
            }

            for (field, value) in unit.descriptive_fields() {
                let attr_key = format!("vs_{field}_{}", display_value(value));
                match self.attribute_keys.get(&attr_key).cloned() {
                    Some(attr_id) => self.link(&seg_id, &attr_id, HAS_ATTRIBUTE),
                    None => debug!(segment = %seg_id, key = %attr_key, "no attribute for static field"),
                }
            }

            if let Some(code) = unit.spatial_function() {
                match self.function_codes.get(code).cloned() {
                    Some(function_id) => self.link(&seg_id, &function_id, USES_FUNCTION),
                    None => debug!(segment = %seg_id, "spatial function code not in function table"),
                }
            }
        }
    }

    // -- 6/7. SDKG incidence links -----------------------------------------

    fn add_function_links(&mut self, tables: &SdkgTables) {
        for (vf_id, behaviors) in &tables.function_graph {
            let function_id = format!("F_{vf_id}");
            if !self.contains(&function_id) {
                continue;
            }
            for (vb_id, weight) in behaviors {
                if *weight <= 0.0 {
                    continue;
                }
                if let Some(behavior_id) = self.behavior_ids.get(vb_id).cloned() {
                    self.link(&function_id, &behavior_id, IMPLEMENTS);
                }
            }
        }
    }

    fn add_behavior_attribute_links(&mut self, tables: &SdkgTables) {
        for (vb_id, attrs) in &tables.behavior_graph {
            let Some(behavior_id) = self.behavior_ids.get(vb_id).cloned() else {
                continue;
            };
            for (attr_key, weight) in attrs {
                if *weight <= 0.0 {
                    continue;
                }
                if let Some(attr_id) = self.attribute_keys.get(attr_key).cloned() {
                    self.link(&behavior_id, &attr_id, HAS_ATTRIBUTE);
                }
            }
        }
    }

    // -- finishing ----------------------------------------------------------

    fn dedupe_links(&mut self) {
        let mut seen = HashSet::new();
        let before = self.links.len();
        self.links.retain(|link| seen.insert(link.clone()));
        debug!(removed = before - self.links.len(), "deduplicated links");
    }

    /// Fill `related` with distinct neighbours in link order.
    fn fill_related(&mut self, max_related: usize) {
        let mut seen: Vec<HashSet<usize>> = vec![HashSet::new(); self.nodes.len()];
        for link in &self.links {
            let (Some(&source), Some(&target)) =
                (self.slots.get(&link.source), self.slots.get(&link.target))
            else {
                continue;
            };
            for (from, to) in [(source, target), (target, source)] {
                if from == to || self.nodes[from].related.len() >= max_related {
                    continue;
                }
                if seen[from].insert(to) {
                    let neighbour = RelatedNode {
                        id: self.nodes[to].id.clone(),
                        label: self.nodes[to].label.clone(),
                    };
                    self.nodes[from].related.push(neighbour);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Segment node construction
// ---------------------------------------------------------------------------

fn segment_node(
    key: JoinKey,
    rows: &[&PointRow],
    knowledge: &KnowledgeIndex<'_>,
    imputation: Option<&ImputationRecord>,
) -> Node {
    let JoinKey {
        mmsi,
        sequence_id: seq_id,
        segment_id: seg_id,
    } = key;
    let ship_type = rows
        .iter()
        .find_map(|r| r.ship_type.clone())
        .unwrap_or_else(|| "Unknown".into());
    let start = rows.first().map(|r| r.timestamp.clone()).unwrap_or_default();
    let end = rows.last().map(|r| r.timestamp.clone()).unwrap_or_default();

    let unit = knowledge.get(&key);
    if unit.is_none() {
        debug!(?key, "no knowledge unit for segment");
    }
    let behavior_block = |k: JoinKey| {
        knowledge
            .get(&k)
            .map(|u| context_block(&u.behavior))
            .unwrap_or_default()
    };

    let mut metadata = Map::new();
    metadata.insert("trajectory_id".into(), json!(seq_id.to_string()));
    metadata.insert("vessel_id".into(), json!(mmsi.to_string()));
    metadata.insert("vessel_type".into(), json!(ship_type));
    metadata.insert("num_points".into(), json!(rows.len()));
    metadata.insert("start_time".into(), json!(start));
    metadata.insert("end_time".into(), json!(end));

    let detail = SegmentDetail {
        trajectory_id: seq_id.to_string(),
        vessel_id: mmsi.to_string(),
        vessel_type: ship_type.clone(),
        static_attributes: unit.map(static_attributes).unwrap_or_default(),
        context: SegmentContext {
            current_behavior: behavior_block(key),
            previous_behavior: behavior_block(key.shifted(-1)),
            next_behavior: behavior_block(key.shifted(1)),
        },
        behavior_estimator: imputation
            .and_then(|r| r.behavior_estimator.as_ref())
            .map(|b| BehaviorEstimator {
                graph_support: Some(text_field(b, "graph_support")),
                contextual_justification: Some(text_field(b, "contextual_justification")),
            })
            .unwrap_or_default(),
        method_selector: imputation
            .and_then(|r| r.method_selector.as_ref())
            .map(|b| MethodSelector {
                statistical_support: Some(text_field(b, "statistical_support")),
            })
            .unwrap_or_default(),
        explanation_composer: imputation
            .and_then(|r| r.explanation_composer.as_ref())
            .map(|b| ExplanationComposer {
                regulatory_rule_cue: Some(text_field(b, "regulatory_rule_cue")),
                operational_protocol_rationale: Some(text_field(
                    b,
                    "operational_protocol_rationale",
                )),
            })
            .unwrap_or_default(),
    };

    Node {
        id: format!("TRJ_{seq_id}_SEG_{seg_id}"),
        label: format!("Segment TRJ_{seq_id}_SEG_{seg_id}"),
        summary: format!("Segment {seg_id} of trajectory {seq_id}"),
        description: vec![
            format!("MMSI: {mmsi}"),
            format!("Ship Type: {ship_type}"),
            format!("Number of data points: {}", rows.len()),
            format!("Start time: {start}"),
            format!("End time: {end}"),
        ],
        metadata,
        related: vec![],
        kind: NodeKind::Segment(Box::new(detail)),
    }
}

/// `"{Title Cased Field}: {value}"` for each non-identifier, non-empty field.
fn static_attributes(unit: &KnowledgeUnit) -> Vec<String> {
    unit.descriptive_fields()
        .filter(|(_, v)| is_truthy(v))
        .map(|(k, v)| format!("{}: {}", title_case(k), display_value(v)))
        .collect()
}

/// Behavior block without the narrative field or empty values.
fn context_block(behavior: &Map<String, Value>) -> Map<String, Value> {
    behavior
        .iter()
        .filter(|(k, v)| k.as_str() != NARRATIVE_FIELD && is_truthy(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn text_field(block: &Map<String, Value>, key: &str) -> String {
    block.get(key).map(display_value).unwrap_or_default()
}

/// `vessel_length` → `Vessel Length`.
pub fn title_case(field: &str) -> String {
    field
        .replace('_', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn last_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

fn first_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Assemble the graph in memory.
///
/// Point rows are restricted to trajectories named by the knowledge units;
/// if none remain the assembly fails with a validation error.
pub fn build_graph(sources: &GraphSources, opts: &GraphOptions) -> Result<AssembledGraph> {
    let pairs = inputs::trajectory_pairs(&sources.units);
    let rows: Vec<&PointRow> = sources
        .points
        .iter()
        .filter(|r| pairs.contains(&r.trajectory_key()))
        .collect();
    if rows.is_empty() {
        return Err(ClearKgError::validation(
            "no matching point data found for the knowledge-unit entries",
        ));
    }

    let knowledge = KnowledgeIndex::new(&sources.units);
    let imputations: HashMap<JoinKey, &ImputationRecord> =
        sources.imputations.iter().map(|r| (r.key, r)).collect();
    debug!(
        knowledge_units = knowledge.len(),
        imputations = imputations.len(),
        rows = rows.len(),
        "join inputs ready"
    );

    let mut builder = GraphBuilder::default();
    builder.add_behaviors(&sources.tables);
    builder.add_functions(&sources.tables);
    builder.add_attributes(&sources.tables);
    builder.add_trajectories(&rows, &knowledge, &imputations);
    builder.add_knowledge_links(&sources.units);
    builder.add_function_links(&sources.tables);
    builder.add_behavior_attribute_links(&sources.tables);

    if opts.dedupe_links {
        builder.dedupe_links();
    }
    builder.fill_related(opts.max_related);

    let stats = GraphStats::collect(&builder.nodes, &builder.links);
    Ok(AssembledGraph {
        nodes: builder.nodes,
        links: builder.links,
        stats,
    })
}

/// Run the Graph Assembler stage: load inputs, build, write node files and
/// the index.
#[instrument(skip_all, fields(dataset = %dataset.name))]
pub fn assemble_graph(
    dataset: &DatasetInputs,
    layout: &OutputLayout,
    opts: &GraphOptions,
    progress: &dyn ProgressReporter,
) -> Result<StageReport> {
    progress.update(0.0, "Start converting SDKG to knowledge graph");

    progress.update(12.5, "Loading SDKG files");
    let tables = SdkgTables::load(
        &dataset.behavior_graph,
        &dataset.behavior_nodes,
        &dataset.function_graph,
        &dataset.function_nodes,
        &dataset.attribute_graph,
    )?;
    let units = inputs::load_knowledge_units(&dataset.knowledge_units)?;
    let imputations = inputs::load_imputations(&dataset.imputation_results)?;

    progress.update(17.5, "Creating data mapping");
    progress.update(25.0, "Reading CSV data");
    let points = inputs::load_points(&dataset.points)?;

    progress.update(30.0, "start building knowledge graph");
    let sources = GraphSources {
        tables,
        units,
        imputations,
        points,
    };
    let graph = build_graph(&sources, opts)?;

    progress.update(50.0, "saving node files");
    for node in &graph.nodes {
        check_file_id(&node.id)?;
        write_json(&layout.node_file(&node.id), node)?;
    }

    progress.update(55.0, "create index file");
    write_json(&layout.index_file(), &graph.index())?;

    let stats = &graph.stats;
    info!(
        total_nodes = stats.total_nodes,
        total_links = stats.total_links,
        nodes_by_type = ?stats.nodes_by_type,
        links_by_relation = ?stats.links_by_relation,
        "graph assembly complete"
    );
    progress.update(100.0, "conversion completed");

    Ok(StageReport {
        message: format!(
            "conversion completed: {} nodes, {} relationships",
            stats.total_nodes, stats.total_links
        ),
        outputs: vec![layout.nodes_dir(), layout.index_file()],
        stats: Some(graph.stats),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::test_support;
    use clearkg_shared::NodeType;

    fn fixture_graph(opts: &GraphOptions) -> AssembledGraph {
        build_graph(&test_support::graph_sources(), opts).unwrap()
    }

    fn count(graph: &AssembledGraph, source: &str, target: &str, relation: &str) -> usize {
        graph
            .links
            .iter()
            .filter(|l| l.source == source && l.target == target && l.relation == relation)
            .count()
    }

    #[test]
    fn pattern_key_strips_parentheticals() {
        let a = json!({"speed_profile": "accelerating (strong)", "course_change": "straight",
                       "heading_fluctuation": "low", "intent": "transit", "duration": "short"});
        let b = json!({"speed_profile": "accelerating (mild)", "course_change": " straight ",
                       "heading_fluctuation": "low", "intent": "transit (port)", "duration": "short"});
        let (Value::Object(a), Value::Object(b)) = (a, b) else { unreachable!() };
        assert_eq!(PatternKey::from_fields(&a), PatternKey::from_fields(&b));
        assert_eq!(PatternKey::from_fields(&a).parts()[0], "accelerating");
    }

    #[test]
    fn identical_patterns_collapse_to_one_behavior() {
        let graph = fixture_graph(&GraphOptions::default());
        let behaviors: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| n.node_type() == NodeType::Behavior)
            .collect();
        assert_eq!(behaviors.len(), 1);
        let b = behaviors[0];
        assert_eq!(b.id, "B_vb_0001");
        assert_eq!(b.label, "Behavior vb_0001");
        assert_eq!(b.kind, NodeKind::Behavior { degree: 2, support: 2 });
        assert_eq!(b.metadata["merged_ids"], json!(["vb_0001", "vb_0002"]));
        assert_eq!(graph.stats.nodes_by_type["behavior"], 1);
    }

    #[test]
    fn node_ids_and_degrees() {
        let graph = fixture_graph(&GraphOptions::default());
        let ids: Vec<_> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["B_vb_0001", "F_vf_01", "A_001", "A_002", "T_1", "TRJ_1_SEG_1", "TRJ_1_SEG_2"]
        );
        assert_eq!(graph.node("A_001").unwrap().label, "ship_type: Cargo");
        assert_eq!(graph.node("A_001").unwrap().kind, NodeKind::Attribute { degree: 2 });
        assert_eq!(graph.node("F_vf_01").unwrap().kind, NodeKind::Function { degree: 2 });
        assert_eq!(graph.node("T_1").unwrap().kind, NodeKind::Trajectory { degree: 2 });
        assert_eq!(graph.node("T_1").unwrap().label, "Trajectory 100");
        // Trajectory 2 is not named by any knowledge unit.
        assert!(graph.node("T_2").is_none());
    }

    #[test]
    fn links_follow_join_rules() {
        let graph = fixture_graph(&GraphOptions::default());
        assert_eq!(count(&graph, "TRJ_1_SEG_1", "T_1", PART_OF), 1);
        assert_eq!(count(&graph, "TRJ_1_SEG_2", "T_1", PART_OF), 1);
        assert_eq!(count(&graph, "TRJ_1_SEG_1", "B_vb_0001", EXHIBITS_BEHAVIOR), 1);
        // Segment 2's behavior block has a pattern no behavior node carries.
        assert_eq!(count(&graph, "TRJ_1_SEG_2", "B_vb_0001", EXHIBITS_BEHAVIOR), 0);
        assert_eq!(count(&graph, "TRJ_1_SEG_1", "A_001", HAS_ATTRIBUTE), 1);
        assert_eq!(count(&graph, "TRJ_1_SEG_1", "A_002", HAS_ATTRIBUTE), 1);
        assert_eq!(count(&graph, "TRJ_1_SEG_2", "A_001", HAS_ATTRIBUTE), 1);
        assert_eq!(count(&graph, "TRJ_1_SEG_1", "F_vf_01", USES_FUNCTION), 1);
        // vf_01 → vb_0002 resolves to the canonical behavior; zero weights are ignored.
        assert_eq!(count(&graph, "F_vf_01", "B_vb_0001", IMPLEMENTS), 1);
        // Both merged behavior entries point at A_001.
        assert_eq!(count(&graph, "B_vb_0001", "A_001", HAS_ATTRIBUTE), 2);
        assert_eq!(count(&graph, "B_vb_0001", "A_002", HAS_ATTRIBUTE), 0);
        assert_eq!(graph.stats.total_links, 10);
    }

    #[test]
    fn dedupe_option_keeps_first_occurrence() {
        let graph = fixture_graph(&GraphOptions {
            dedupe_links: true,
            ..Default::default()
        });
        assert_eq!(count(&graph, "B_vb_0001", "A_001", HAS_ATTRIBUTE), 1);
        assert_eq!(graph.stats.total_links, 9);
        assert_eq!(graph.stats.links_by_relation[HAS_ATTRIBUTE], 4);
    }

    #[test]
    fn segment_joins_knowledge_unit_and_imputation() {
        let graph = fixture_graph(&GraphOptions::default());
        let node = graph.node("TRJ_1_SEG_1").unwrap();
        let NodeKind::Segment(detail) = &node.kind else {
            panic!("expected segment");
        };

        assert_eq!(detail.vessel_id, "100");
        assert_eq!(detail.vessel_type, "Cargo");
        assert_eq!(
            detail.static_attributes,
            vec!["Ship Type: Cargo".to_string(), "Length: large".to_string()]
        );
        let current = &detail.context.current_behavior;
        assert_eq!(current["intent"], "transit");
        assert!(!current.contains_key("llm_output"));
        assert!(detail.context.previous_behavior.is_empty());
        // Next segment's block, with its empty field dropped.
        assert_eq!(detail.context.next_behavior["intent"], "fishing");
        assert!(!detail.context.next_behavior.contains_key("heading_fluctuation"));

        assert_eq!(detail.behavior_estimator.graph_support.as_deref(), Some("strong"));
        assert_eq!(detail.behavior_estimator.contextual_justification.as_deref(), Some(""));
        assert_eq!(detail.method_selector.statistical_support.as_deref(), Some("p<0.05"));
        assert_eq!(detail.explanation_composer, ExplanationComposer::default());

        let json = serde_json::to_value(node).unwrap();
        assert_eq!(json["explanation_composer"], json!({}));
        assert_eq!(json["behavior_estimator"]["contextual_justification"], "");
    }

    #[test]
    fn segment_without_matches_gets_empty_blocks() {
        let graph = fixture_graph(&GraphOptions::default());
        let NodeKind::Segment(detail) = &graph.node("TRJ_1_SEG_2").unwrap().kind else {
            panic!("expected segment");
        };
        assert_eq!(detail.behavior_estimator, BehaviorEstimator::default());
        assert_eq!(detail.context.previous_behavior["intent"], "transit");
        assert!(detail.context.next_behavior.is_empty());
    }

    #[test]
    fn related_lists_distinct_neighbours_with_cap() {
        let graph = fixture_graph(&GraphOptions::default());
        let behavior = graph.node("B_vb_0001").unwrap();
        let ids: Vec<_> = behavior.related.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["TRJ_1_SEG_1", "F_vf_01", "A_001"]);

        let capped = fixture_graph(&GraphOptions {
            max_related: 1,
            ..Default::default()
        });
        assert!(capped.nodes.iter().all(|n| n.related.len() <= 1));
    }

    #[test]
    fn ids_unusable_as_file_names_are_skipped() {
        let mut sources = test_support::graph_sources();
        let (_, fields) = sources.tables.behavior_nodes[0].clone();
        sources.tables.behavior_nodes.insert(0, ("../escape".into(), fields));
        let (_, spec) = sources.tables.function_nodes[0].clone();
        sources.tables.function_nodes.push(("x/y".into(), spec));

        let graph = build_graph(&sources, &GraphOptions::default()).unwrap();
        assert!(graph.nodes.iter().all(|n| is_file_safe_id(&n.id)));
        assert!(graph.node("B_vb_0001").is_some());
        assert!(graph.node("F_x/y").is_none());
    }

    #[test]
    fn non_string_static_fields_match_exported_attribute_names() {
        let mut sources = test_support::graph_sources();
        sources
            .tables
            .attribute_graph
            .push(("hazardous".into(), vec![("True".into(), 1)]));
        sources.units[0]
            .static_fields
            .insert("hazardous".into(), json!(true));

        let graph = build_graph(&sources, &GraphOptions::default()).unwrap();
        assert_eq!(graph.node("A_003").unwrap().label, "hazardous: True");
        assert_eq!(count(&graph, "TRJ_1_SEG_1", "A_003", HAS_ATTRIBUTE), 1);
        let NodeKind::Segment(detail) = &graph.node("TRJ_1_SEG_1").unwrap().kind else {
            panic!("expected segment");
        };
        assert!(detail.static_attributes.contains(&"Hazardous: True".to_string()));
    }

    #[test]
    fn no_matching_points_is_validation_error() {
        let mut sources = test_support::graph_sources();
        sources.points.retain(|r| r.mmsi != 100);
        let err = build_graph(&sources, &GraphOptions::default()).unwrap_err();
        assert!(matches!(err, ClearKgError::Validation { .. }));
    }

    #[test]
    fn helpers() {
        assert_eq!(title_case("vessel_length"), "Vessel Length");
        assert_eq!(title_case("SHIP_type"), "Ship Type");
        assert_eq!(last_chars("abcdefghij", 8), "cdefghij");
        assert_eq!(last_chars("abc", 8), "abc");
        assert_eq!(first_chars("héllo", 2), "hé");
    }

    #[test]
    fn stage_writes_node_files_and_index() {
        let (tmp, inputs) = test_support::dataset_dir();
        let layout = OutputLayout::new(&inputs.output_dir);

        let report =
            assemble_graph(&inputs, &layout, &GraphOptions::default(), &SilentProgress).unwrap();
        assert_eq!(report.message, "conversion completed: 7 nodes, 10 relationships");

        let index = crate::artifacts::load_index(&layout).unwrap();
        assert_eq!(index.nodes.len(), 7);
        assert_eq!(index.links.len(), 10);
        let node = crate::artifacts::load_node(&layout, "TRJ_1_SEG_1").unwrap();
        assert_eq!(node.node_type(), NodeType::Segment);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn stage_fails_on_missing_input() {
        let (tmp, inputs) = test_support::dataset_dir();
        std::fs::remove_file(&inputs.function_nodes).unwrap();
        let layout = OutputLayout::new(&inputs.output_dir);

        let err =
            assemble_graph(&inputs, &layout, &GraphOptions::default(), &SilentProgress).unwrap_err();
        assert!(matches!(err, ClearKgError::MissingInput { .. }));
        assert!(!layout.index_file().exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
