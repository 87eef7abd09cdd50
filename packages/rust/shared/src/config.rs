//! Application configuration for the CLEAR knowledge-graph pipeline.
//!
//! User config lives at `~/.clearkg/clearkg.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ClearKgError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "clearkg.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".clearkg";

// ---------------------------------------------------------------------------
// Config structs (matching clearkg.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Graph assembly options.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Subgraph precomputation options.
    #[serde(default)]
    pub subgraph: SubgraphConfig,

    /// Orchestrator and worker options.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Registered datasets.
    #[serde(default = "default_datasets")]
    pub datasets: Vec<DatasetConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            graph: GraphConfig::default(),
            subgraph: SubgraphConfig::default(),
            pipeline: PipelineConfig::default(),
            datasets: default_datasets(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root that relative dataset paths are resolved against.
    #[serde(default = "default_project_root")]
    pub project_root: String,

    /// Artifact output directory (segments, index, nodes, subgraphs).
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Path of the libSQL task-status database.
    #[serde(default = "default_task_db")]
    pub task_db: String,

    /// Dataset used when a request does not name one.
    #[serde(default = "default_dataset")]
    pub dataset: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            output_dir: default_output_dir(),
            task_db: default_task_db(),
            dataset: default_dataset(),
        }
    }
}

fn default_project_root() -> String {
    ".".into()
}
fn default_output_dir() -> String {
    "./data".into()
}
fn default_task_db() -> String {
    "./var/tasks.db".into()
}
fn default_dataset() -> String {
    "demo-dk".into()
}

/// `[graph]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Drop exact duplicate `(source, target, relation)` links.
    #[serde(default)]
    pub dedupe_links: bool,

    /// Maximum number of `related` entries written per node.
    #[serde(default = "default_max_related")]
    pub max_related: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            dedupe_links: false,
            max_related: default_max_related(),
        }
    }
}

fn default_max_related() -> usize {
    20
}

/// `[subgraph]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphConfig {
    /// Maximum BFS depth from the center node.
    #[serde(default = "default_max_level")]
    pub max_level: u32,

    /// Skip nodes already recorded in the checkpoint.
    #[serde(default = "default_true")]
    pub resume: bool,
}

impl Default for SubgraphConfig {
    fn default() -> Self {
        Self {
            max_level: default_max_level(),
            resume: true,
        }
    }
}

fn default_max_level() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of pipeline jobs running at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Check the cancel flag between subgraph nodes.
    #[serde(default)]
    pub cooperative_cancellation: bool,

    /// Default trajectory length used to resolve dataset paths.
    #[serde(default = "default_trajectory_len")]
    pub trajectory_len: u32,

    /// Default trajectory count used to resolve dataset paths.
    #[serde(default = "default_trajectory_num")]
    pub trajectory_num: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            cooperative_cancellation: false,
            trajectory_len: default_trajectory_len(),
            trajectory_num: default_trajectory_num(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}
fn default_trajectory_len() -> u32 {
    200
}
fn default_trajectory_num() -> u32 {
    10000
}

/// `[[datasets]]` entry. Paths may contain `{trajectory_len}` and
/// `{trajectory_num}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset name used in requests (e.g. `demo-dk`).
    pub name: String,
    /// Raw point table (CSV).
    pub points: String,
    /// Knowledge-unit list (JSON).
    pub knowledge_units: String,
    /// Imputation-result list (JSON).
    pub imputation_results: String,
    /// Behavior-graph edge table.
    pub behavior_graph: String,
    /// Behavior-node table.
    pub behavior_nodes: String,
    /// Function-graph edge table.
    pub function_graph: String,
    /// Function-node table.
    pub function_nodes: String,
    /// Attribute incidence table.
    pub attribute_graph: String,
    /// Per-dataset output directory (defaults to `[defaults].output_dir`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

fn default_datasets() -> Vec<DatasetConfig> {
    vec![
        demo_dataset(
            "demo-dk",
            "Default",
            "aisdk-2024-03-01@31_filtered10_1000000000",
        ),
        demo_dataset(
            "demo-us",
            "Default_us",
            "AIS_2024_04_01@15_filtered360_1000000000",
        ),
    ]
}

fn demo_dataset(name: &str, experiment: &str, raw_prefix: &str) -> DatasetConfig {
    let results = format!("vista/results/{experiment}");
    let sdkg = format!("{results}/SDKG");
    DatasetConfig {
        name: name.into(),
        points: format!(
            "vista/data/ProcessedData/{raw_prefix}_standardized_with_SequenceId_SegementId_PointInfo_{{trajectory_len}}_{{trajectory_num}}.csv"
        ),
        knowledge_units: format!(
            "{results}/KU/knowledge_units_trajectory{{trajectory_num}}_len{{trajectory_len}}_seed42_4.json"
        ),
        imputation_results: format!(
            "{results}/ImputationResults/imputation_results_trajectory{{trajectory_num}}_len{{trajectory_len}}_seed42_4_4.json"
        ),
        behavior_graph: format!("{sdkg}/SDK_graph_vb_4.json"),
        behavior_nodes: format!("{sdkg}/SDK_graph_vb_node_4.json"),
        function_graph: format!("{sdkg}/SDK_graph_vf_4.json"),
        function_nodes: format!("{sdkg}/SDK_graph_vf_node_4.json"),
        attribute_graph: format!("{sdkg}/SDK_graph_vs_4.json"),
        output_dir: None,
    }
}

// ---------------------------------------------------------------------------
// Resolved inputs (runtime, merged from config + request)
// ---------------------------------------------------------------------------

/// Concrete file locations for one pipeline run.
#[derive(Debug, Clone)]
pub struct DatasetInputs {
    pub name: String,
    pub points: PathBuf,
    pub knowledge_units: PathBuf,
    pub imputation_results: PathBuf,
    pub behavior_graph: PathBuf,
    pub behavior_nodes: PathBuf,
    pub function_graph: PathBuf,
    pub function_nodes: PathBuf,
    pub attribute_graph: PathBuf,
    pub output_dir: PathBuf,
}

impl AppConfig {
    /// Look up a dataset by name.
    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig> {
        self.datasets
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ClearKgError::config(format!("unknown dataset: {name}")))
    }

    /// Resolve a dataset's paths for the given trajectory parameters.
    pub fn resolve_inputs(
        &self,
        name: &str,
        trajectory_len: Option<u32>,
        trajectory_num: Option<u32>,
    ) -> Result<DatasetInputs> {
        let dataset = self.dataset(name)?;
        let root = PathBuf::from(&self.defaults.project_root);
        let len = trajectory_len.unwrap_or(self.pipeline.trajectory_len);
        let num = trajectory_num.unwrap_or(self.pipeline.trajectory_num);

        let resolve = |template: &str| {
            let path = PathBuf::from(expand_template(template, len, num));
            if path.is_absolute() {
                path
            } else {
                root.join(path)
            }
        };

        Ok(DatasetInputs {
            name: dataset.name.clone(),
            points: resolve(&dataset.points),
            knowledge_units: resolve(&dataset.knowledge_units),
            imputation_results: resolve(&dataset.imputation_results),
            behavior_graph: resolve(&dataset.behavior_graph),
            behavior_nodes: resolve(&dataset.behavior_nodes),
            function_graph: resolve(&dataset.function_graph),
            function_nodes: resolve(&dataset.function_nodes),
            attribute_graph: resolve(&dataset.attribute_graph),
            output_dir: resolve(
                dataset
                    .output_dir
                    .as_deref()
                    .unwrap_or(&self.defaults.output_dir),
            ),
        })
    }
}

fn expand_template(template: &str, trajectory_len: u32, trajectory_num: u32) -> String {
    template
        .replace("{trajectory_len}", &trajectory_len.to_string())
        .replace("{trajectory_num}", &trajectory_num.to_string())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.clearkg/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ClearKgError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.clearkg/clearkg.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ClearKgError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ClearKgError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ClearKgError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ClearKgError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ClearKgError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
