//! Core domain types: knowledge-graph nodes and links, segment records,
//! subgraph views, and the precomputation checkpoint.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// NodeType
// ---------------------------------------------------------------------------

/// The five node variants of the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Behavior,
    Attribute,
    Function,
    Segment,
    Trajectory,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Behavior => "behavior",
            Self::Attribute => "attribute",
            Self::Function => "function",
            Self::Segment => "segment",
            Self::Trajectory => "trajectory",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Neighbour reference stored in a node's `related` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedNode {
    pub id: String,
    pub label: String,
}

/// A full node record, as written to `nodes/<id>.json`.
///
/// The variant-specific fields are flattened next to the common ones and
/// discriminated by `type`; an unknown `type` fails deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub related: Vec<RelatedNode>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    /// The `{id, type, label}` projection written to the graph index.
    pub fn to_index(&self) -> IndexNode {
        IndexNode {
            id: self.id.clone(),
            node_type: self.node_type(),
            label: self.label.clone(),
        }
    }
}

/// Variant-specific node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Behavior { degree: usize, support: usize },
    Attribute { degree: usize },
    Function { degree: usize },
    Segment(Box<SegmentDetail>),
    Trajectory { degree: usize },
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Behavior { .. } => NodeType::Behavior,
            Self::Attribute { .. } => NodeType::Attribute,
            Self::Function { .. } => NodeType::Function,
            Self::Segment(_) => NodeType::Segment,
            Self::Trajectory { .. } => NodeType::Trajectory,
        }
    }
}

/// Segment-only fields joined from knowledge units and imputation results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentDetail {
    pub trajectory_id: String,
    pub vessel_id: String,
    pub vessel_type: String,
    #[serde(default)]
    pub static_attributes: Vec<String>,
    #[serde(default)]
    pub context: SegmentContext,
    #[serde(default)]
    pub behavior_estimator: BehaviorEstimator,
    #[serde(default)]
    pub method_selector: MethodSelector,
    #[serde(default)]
    pub explanation_composer: ExplanationComposer,
}

/// Behavior of this segment and its immediate neighbours in the trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentContext {
    #[serde(default)]
    pub current_behavior: Map<String, Value>,
    #[serde(default)]
    pub previous_behavior: Map<String, Value>,
    #[serde(default)]
    pub next_behavior: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorEstimator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_support: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contextual_justification: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistical_support: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationComposer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regulatory_rule_cue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational_protocol_rationale: Option<String>,
}

// ---------------------------------------------------------------------------
// Links and the graph index
// ---------------------------------------------------------------------------

/// A directed, typed edge between two node ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub source: String,
    pub target: String,
    pub relation: String,
}

impl Link {
    pub fn new(source: impl Into<String>, target: impl Into<String>, relation: &str) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relation: relation.to_string(),
        }
    }
}

/// Node projection stored in the graph index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
}

/// Root structure for `sdkg_index.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphIndex {
    pub nodes: Vec<IndexNode>,
    pub links: Vec<Link>,
}

// ---------------------------------------------------------------------------
// Segment records (segments.json)
// ---------------------------------------------------------------------------

/// A single timestamped position on a segment polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub timestamp: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sog: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cog: Option<f64>,
}

/// One trajectory segment as consumed by the map view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: String,
    pub trajectory_id: String,
    pub vessel_id: String,
    pub start_time: String,
    pub end_time: String,
    pub short_description: String,
    pub points: Vec<TrackPoint>,
}

// ---------------------------------------------------------------------------
// Subgraphs
// ---------------------------------------------------------------------------

/// A node inside a precomputed subgraph, annotated with its BFS level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    pub level: u32,
    #[serde(rename = "isCenter")]
    pub is_center: bool,
}

/// A link inside a precomputed subgraph, annotated with its BFS level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphLink {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub level: u32,
}

/// Root structure for `subgraph/<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphRecord {
    pub nodes: Vec<SubgraphNode>,
    pub links: Vec<SubgraphLink>,
    pub all_node_ids: Vec<String>,
    pub center_node_id: String,
    pub max_level: u32,
    pub total_nodes: usize,
    pub total_links: usize,
}

/// A node whose subgraph could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedNode {
    pub node_id: String,
    pub error: String,
}

/// Root structure for `subgraph_checkpoint.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub processed_nodes: BTreeSet<String>,
    #[serde(default)]
    pub failed_nodes: Vec<FailedNode>,
    #[serde(default)]
    pub total_processed: usize,
}

/// One entry of `subgraphs_index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub node_id: String,
    pub node_label: String,
    pub node_type: NodeType,
    pub file_path: String,
}

/// Root structure for `subgraphs_index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphCatalog {
    pub generated_at: String,
    pub total_nodes: usize,
    pub subgraphs: Vec<CatalogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_node() -> Node {
        Node {
            id: "TRJ_7_SEG_2".into(),
            label: "Segment TRJ_7_SEG_2".into(),
            summary: "Segment 2 of trajectory 7".into(),
            description: vec!["MMSI: 100".into()],
            metadata: Map::new(),
            related: vec![],
            kind: NodeKind::Segment(Box::new(SegmentDetail {
                trajectory_id: "7".into(),
                vessel_id: "100".into(),
                vessel_type: "Cargo".into(),
                ..Default::default()
            })),
        }
    }

    #[test]
    fn node_serializes_flat_with_type_tag() {
        let json = serde_json::to_value(segment_node()).expect("serialize");
        assert_eq!(json["type"], "segment");
        assert_eq!(json["vessel_type"], "Cargo");
        // Absent imputation blocks are written as empty objects.
        assert_eq!(json["behavior_estimator"], serde_json::json!({}));
        assert_eq!(json["context"]["current_behavior"], serde_json::json!({}));
    }

    #[test]
    fn node_deserializes_variant() {
        let json = serde_json::to_string(&segment_node()).expect("serialize");
        let parsed: Node = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.node_type(), NodeType::Segment);
        assert_eq!(parsed, segment_node());

        let behavior = r#"{"id":"B_1","type":"behavior","label":"Behavior 1","degree":3,"support":1}"#;
        let parsed: Node = serde_json::from_str(behavior).expect("behavior");
        assert_eq!(parsed.kind, NodeKind::Behavior { degree: 3, support: 1 });
        assert!(parsed.description.is_empty());
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let raw = r#"{"id":"X_1","type":"vessel","label":"x"}"#;
        assert!(serde_json::from_str::<Node>(raw).is_err());
        assert!(serde_json::from_str::<IndexNode>(raw).is_err());
    }

    #[test]
    fn missing_sog_is_absent_not_zero() {
        let point = TrackPoint {
            timestamp: "2024-03-01T00:00:00Z".into(),
            lat: 55.0,
            lon: 12.0,
            sog: None,
            cog: Some(90.0),
        };
        let json = serde_json::to_value(&point).expect("serialize");
        assert!(json.get("sog").is_none());
        assert_eq!(json["cog"], 90.0);
    }

    #[test]
    fn subgraph_record_uses_camel_case() {
        let record = SubgraphRecord {
            nodes: vec![SubgraphNode {
                id: "A".into(),
                node_type: NodeType::Attribute,
                label: "a".into(),
                level: 0,
                is_center: true,
            }],
            links: vec![],
            all_node_ids: vec!["A".into()],
            center_node_id: "A".into(),
            max_level: 1,
            total_nodes: 1,
            total_links: 0,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["centerNodeId"], "A");
        assert_eq!(json["allNodeIds"][0], "A");
        assert_eq!(json["nodes"][0]["isCenter"], true);
    }

    #[test]
    fn checkpoint_tolerates_missing_fields() {
        let parsed: Checkpoint =
            serde_json::from_str(r#"{"processed_nodes":["B_2","A_001"]}"#).expect("parse");
        assert_eq!(parsed.processed_nodes.len(), 2);
        assert!(parsed.failed_nodes.is_empty());
        // Sorted on output.
        let json = serde_json::to_value(&parsed).expect("serialize");
        assert_eq!(json["processed_nodes"][0], "A_001");
    }
}
