//! Pipeline stages and orchestration for the CLEAR knowledge graph.
//!
//! Three stages run in order over one dataset:
//! [`segments`] (point table → `segments.json`), [`graph`] (SDKG tables,
//! knowledge units and imputations → node files and `sdkg_index.json`) and
//! [`subgraph`] (bounded neighbourhoods per node, checkpointed).
//! [`pipeline::Pipeline`] runs them as background tasks and reports progress
//! to a [`clearkg_storage::TaskStore`].

pub mod artifacts;
pub mod graph;
pub mod inputs;
pub mod pipeline;
pub mod segments;
pub mod subgraph;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use artifacts::{EnrichedSubgraph, OutputLayout};
pub use graph::{GraphOptions, GraphStats};
pub use pipeline::{Pipeline, PipelineOutcome, ProgressReporter, SilentProgress, StageReport};
pub use subgraph::SubgraphOptions;
