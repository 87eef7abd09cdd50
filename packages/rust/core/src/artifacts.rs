//! Output directory layout and the read side of the generated artifacts.
//!
//! ```text
//! <output_dir>/
//! ├── segments.json
//! ├── sdkg_index.json
//! ├── nodes/<id>.json
//! ├── subgraph/<id>.json
//! ├── subgraph_checkpoint.json
//! └── subgraphs_index.json
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use clearkg_shared::{
    ClearKgError, GraphIndex, Node, NodeType, Result, SubgraphCatalog, SubgraphLink,
    SubgraphRecord,
};

/// Paths of every artifact under one output directory.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segments_file(&self) -> PathBuf {
        self.root.join("segments.json")
    }

    pub fn index_file(&self) -> PathBuf {
        self.root.join("sdkg_index.json")
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn node_file(&self, node_id: &str) -> PathBuf {
        self.nodes_dir().join(format!("{node_id}.json"))
    }

    pub fn subgraph_dir(&self) -> PathBuf {
        self.root.join("subgraph")
    }

    pub fn subgraph_file(&self, node_id: &str) -> PathBuf {
        self.subgraph_dir().join(format!("{node_id}.json"))
    }

    /// Catalog-relative path of a subgraph file.
    pub fn subgraph_rel_path(node_id: &str) -> String {
        format!("subgraph/{node_id}.json")
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.root.join("subgraph_checkpoint.json")
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.root.join("subgraphs_index.json")
    }

    /// Locations reported in a finished task's result.
    pub fn output_files(&self) -> Vec<String> {
        let dir = |p: PathBuf| format!("{}/", p.display());
        vec![
            self.segments_file().display().to_string(),
            dir(self.subgraph_dir()),
            self.index_file().display().to_string(),
            dir(self.nodes_dir()),
        ]
    }
}

/// Whether `node_id` can be used as a file stem under `nodes/` or
/// `subgraph/`: non-empty, no path separators, no `.`/`..`, no NUL.
pub fn is_file_safe_id(node_id: &str) -> bool {
    !node_id.is_empty()
        && node_id != "."
        && node_id != ".."
        && !node_id.contains(['/', '\\', '\0'])
}

/// Reject an id that would resolve outside its artifact directory.
pub fn check_file_id(node_id: &str) -> Result<()> {
    if is_file_safe_id(node_id) {
        Ok(())
    } else {
        Err(ClearKgError::validation(format!(
            "node id {node_id:?} cannot be used as a file name"
        )))
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Write a pretty-printed JSON file atomically (temp file, then rename).
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| ClearKgError::validation(format!("JSON serialization failed: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ClearKgError::io(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&temp, json).map_err(|e| ClearKgError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| ClearKgError::io(path, e))?;

    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}

/// Read and parse a JSON file. A missing file is [`ClearKgError::MissingInput`];
/// malformed content is a parse error naming the file.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(ClearKgError::missing(path));
    }
    let content = std::fs::read_to_string(path).map_err(|e| ClearKgError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| ClearKgError::parse(format!("{}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

/// Load the graph index (`sdkg_index.json`).
pub fn load_index(layout: &OutputLayout) -> Result<GraphIndex> {
    read_json(&layout.index_file())
}

/// Load one full node record. The `type` tag is validated on parse.
pub fn load_node(layout: &OutputLayout, node_id: &str) -> Result<Node> {
    check_file_id(node_id)?;
    read_json(&layout.node_file(node_id))
}

/// Load the subgraph catalog (`subgraphs_index.json`).
pub fn load_catalog(layout: &OutputLayout) -> Result<SubgraphCatalog> {
    read_json(&layout.catalog_file())
}

/// A subgraph node with display fields joined from its node file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedSubgraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    pub level: u32,
    #[serde(rename = "isCenter")]
    pub is_center: bool,
    pub title: String,
    pub summary: String,
}

/// A subgraph ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedSubgraph {
    pub nodes: Vec<EnrichedSubgraphNode>,
    pub links: Vec<SubgraphLink>,
    pub all_node_ids: Vec<String>,
    pub center_node_id: String,
    pub max_level: u32,
    pub total_nodes: usize,
    pub total_links: usize,
}

/// Load a precomputed subgraph and attach `title`/`summary` to each node.
///
/// Title falls back to the node's label and summary to the empty string when
/// the node file is missing or unreadable.
pub fn load_subgraph(layout: &OutputLayout, node_id: &str) -> Result<EnrichedSubgraph> {
    check_file_id(node_id)?;
    let record: SubgraphRecord = read_json(&layout.subgraph_file(node_id))?;

    let nodes = record
        .nodes
        .into_iter()
        .map(|n| {
            let (title, summary) = match load_node(layout, &n.id) {
                Ok(full) => {
                    let title = if full.label.is_empty() {
                        n.label.clone()
                    } else {
                        full.label
                    };
                    (title, full.summary)
                }
                Err(e) => {
                    debug!(node_id = %n.id, error = %e, "node detail unavailable");
                    let title = if n.label.is_empty() {
                        n.id.clone()
                    } else {
                        n.label.clone()
                    };
                    (title, String::new())
                }
            };
            EnrichedSubgraphNode {
                id: n.id,
                node_type: n.node_type,
                label: n.label,
                level: n.level,
                is_center: n.is_center,
                title,
                summary,
            }
        })
        .collect();

    Ok(EnrichedSubgraph {
        nodes,
        links: record.links,
        all_node_ids: record.all_node_ids,
        center_node_id: record.center_node_id,
        max_level: record.max_level,
        total_nodes: record.total_nodes,
        total_links: record.total_links,
    })
}
