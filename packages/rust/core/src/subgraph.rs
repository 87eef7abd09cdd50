//! Neighborhood Precomputer: depth-bounded BFS subgraph per node, resumable
//! through `subgraph_checkpoint.json`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use clearkg_shared::{
    CatalogEntry, Checkpoint, ClearKgError, FailedNode, GraphIndex, IndexNode, Link, Result,
    SubgraphCatalog, SubgraphLink, SubgraphNode, SubgraphRecord,
};

use crate::artifacts::{OutputLayout, check_file_id, is_file_safe_id, read_json, write_json};
use crate::pipeline::{ProgressReporter, StageReport};

#[derive(Debug, Clone)]
pub struct SubgraphOptions {
    /// BFS depth bound.
    pub max_level: u32,
    /// Skip nodes recorded in the checkpoint.
    pub resume: bool,
    /// Stop between nodes when the cancel flag is raised.
    pub cooperative_cancellation: bool,
}

impl Default for SubgraphOptions {
    fn default() -> Self {
        Self {
            max_level: 1,
            resume: true,
            cooperative_cancellation: false,
        }
    }
}

/// Read-only adjacency over the index's link list.
pub struct GraphArena<'a> {
    index: &'a GraphIndex,
    node_slots: HashMap<&'a str, usize>,
    incident: HashMap<&'a str, Vec<usize>>,
}

impl<'a> GraphArena<'a> {
    pub fn new(index: &'a GraphIndex) -> Self {
        let mut node_slots = HashMap::with_capacity(index.nodes.len());
        for (slot, node) in index.nodes.iter().enumerate() {
            node_slots.entry(node.id.as_str()).or_insert(slot);
        }

        let mut incident: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, link) in index.links.iter().enumerate() {
            incident.entry(link.source.as_str()).or_default().push(i);
            if link.target != link.source {
                incident.entry(link.target.as_str()).or_default().push(i);
            }
        }

        Self {
            index,
            node_slots,
            incident,
        }
    }

    fn links_of(&self, id: &str) -> impl Iterator<Item = &'a Link> + '_ {
        let index = self.index;
        self.incident
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &index.links[i])
    }

    fn node(&self, id: &str) -> Option<&'a IndexNode> {
        let index = self.index;
        self.node_slots.get(id).map(|&slot| &index.nodes[slot])
    }
}

/// BFS from `center` up to `max_level` hops.
///
/// Links are visited once per undirected endpoint pair; the first link met
/// between two nodes is kept with its original direction and relation.
pub fn build_subgraph(arena: &GraphArena<'_>, center: &str, max_level: u32) -> SubgraphRecord {
    let mut visited_nodes: HashSet<&str> = HashSet::from([center]);
    let mut all_node_ids = vec![center.to_string()];
    let mut visited_links: HashSet<(&str, &str)> = HashSet::new();
    let mut nodes = Vec::new();
    let mut links = Vec::new();

    if let Some(info) = arena.node(center) {
        nodes.push(SubgraphNode {
            id: info.id.clone(),
            node_type: info.node_type,
            label: info.label.clone(),
            level: 0,
            is_center: true,
        });
    }

    let mut queue: VecDeque<(&str, u32)> = VecDeque::from([(center, 0)]);
    while let Some((current, level)) = queue.pop_front() {
        if level >= max_level {
            continue;
        }
        let next_level = level + 1;

        for link in arena.links_of(current) {
            let (a, b) = (link.source.as_str(), link.target.as_str());
            let pair = if a <= b { (a, b) } else { (b, a) };
            if !visited_links.insert(pair) {
                continue;
            }
            links.push(SubgraphLink {
                source: link.source.clone(),
                target: link.target.clone(),
                relation: link.relation.clone(),
                level: next_level,
            });

            let other = if a == current { b } else { a };
            if !visited_nodes.insert(other) {
                continue;
            }
            all_node_ids.push(other.to_string());

            match arena.node(other) {
                Some(info) => {
                    nodes.push(SubgraphNode {
                        id: info.id.clone(),
                        node_type: info.node_type,
                        label: info.label.clone(),
                        level: next_level,
                        is_center: false,
                    });
                    if next_level < max_level {
                        queue.push_back((other, next_level));
                    }
                }
                None => debug!(node_id = other, "link endpoint missing from index"),
            }
        }
    }

    SubgraphRecord {
        total_nodes: nodes.len(),
        total_links: links.len(),
        nodes,
        links,
        all_node_ids,
        center_node_id: center.to_string(),
        max_level,
    }
}

/// Load the checkpoint; a missing file is empty, an unreadable one is
/// logged and treated as empty.
pub fn load_checkpoint(layout: &OutputLayout) -> Checkpoint {
    let path = layout.checkpoint_file();
    if !path.exists() {
        return Checkpoint::default();
    }
    match read_json::<Checkpoint>(&path) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting fresh");
            Checkpoint::default()
        }
    }
}

fn save_checkpoint(
    layout: &OutputLayout,
    processed: BTreeSet<String>,
    failed: Vec<FailedNode>,
) -> Result<()> {
    let checkpoint = Checkpoint {
        timestamp: Utc::now().to_rfc3339(),
        total_processed: processed.len() + failed.len(),
        processed_nodes: processed,
        failed_nodes: failed,
    };
    write_json(&layout.checkpoint_file(), &checkpoint)
}

/// Run the Neighborhood Precomputer stage over `sdkg_index.json`.
#[instrument(skip_all, fields(max_level = opts.max_level, resume = opts.resume))]
pub fn precompute_subgraphs(
    layout: &OutputLayout,
    opts: &SubgraphOptions,
    progress: &dyn ProgressReporter,
    cancel: &AtomicBool,
) -> Result<StageReport> {
    progress.update(0.0, "Start generating subgraph");

    let index: GraphIndex = read_json(&layout.index_file())?;
    let subgraph_dir = layout.subgraph_dir();
    std::fs::create_dir_all(&subgraph_dir).map_err(|e| ClearKgError::io(&subgraph_dir, e))?;

    let mut processed = if opts.resume {
        load_checkpoint(layout).processed_nodes
    } else {
        BTreeSet::new()
    };

    let remaining: Vec<&str> = index
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !processed.contains(*id))
        .collect();
    let total = remaining.len();
    info!(
        nodes = index.nodes.len(),
        already_processed = processed.len(),
        remaining = total,
        "precomputing subgraphs"
    );
    progress.update(20.0, &format!("Handle {total} nodes"));

    let arena = GraphArena::new(&index);
    let mut succeeded = 0usize;
    let mut failed = Vec::new();

    for (i, node_id) in remaining.iter().enumerate() {
        if opts.cooperative_cancellation && cancel.load(Ordering::Relaxed) {
            info!(completed = succeeded, "cancelled, saving partial checkpoint");
            save_checkpoint(layout, processed, failed)?;
            return Err(ClearKgError::Cancelled);
        }

        let written = check_file_id(node_id).and_then(|()| {
            let record = build_subgraph(&arena, node_id, opts.max_level);
            write_json(&layout.subgraph_file(node_id), &record)
        });
        match written {
            Ok(()) => {
                processed.insert((*node_id).to_string());
                succeeded += 1;
            }
            Err(e) => {
                warn!(node_id, error = %e, "subgraph failed");
                failed.push(FailedNode {
                    node_id: (*node_id).to_string(),
                    error: e.to_string(),
                });
            }
        }

        let done = i + 1;
        progress.update(
            20.0 + done as f32 / total as f32 * 20.0,
            &format!("generate subgraph: {done}/{total}"),
        );
    }

    let failed_count = failed.len();
    save_checkpoint(layout, processed, failed)?;

    progress.update(40.0, "generate subgraph index");
    let subgraphs: Vec<CatalogEntry> = index
        .nodes
        .iter()
        .filter(|n| is_file_safe_id(&n.id) && layout.subgraph_file(&n.id).exists())
        .map(|n| CatalogEntry {
            node_id: n.id.clone(),
            node_label: n.label.clone(),
            node_type: n.node_type,
            file_path: OutputLayout::subgraph_rel_path(&n.id),
        })
        .collect();
    let catalog = SubgraphCatalog {
        generated_at: Utc::now().to_rfc3339(),
        total_nodes: index.nodes.len(),
        subgraphs,
    };
    write_json(&layout.catalog_file(), &catalog)?;

    progress.update(100.0, "Subgraph generation completed");
    info!(succeeded, failed = failed_count, "subgraph precomputation complete");

    Ok(StageReport {
        message: format!(
            "Subgraph generation completed: {succeeded} successful, {failed_count} failed"
        ),
        outputs: vec![subgraph_dir, layout.checkpoint_file(), layout.catalog_file()],
        stats: None,
    })
}
