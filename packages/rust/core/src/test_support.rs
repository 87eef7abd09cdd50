//! Small on-disk dataset shared by the stage tests.
//!
//! Trajectory 1 (vessel 100) has two segments with knowledge units; segment
//! 1 also has an imputation record. Trajectory 2 has points only.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use clearkg_shared::{AppConfig, DatasetConfig, DatasetInputs};

use crate::graph::GraphSources;
use crate::inputs::{self, SdkgTables};

pub const DATASET: &str = "fixture";

const POINTS_CSV: &str = "\
mmsi,sequence_id,segment_id,timestamp,latitude,longitude,sog,cog,ship_type
100,1,1,2024-03-01 00:01:00,55.1,12.1,10.5,,Cargo
100,1,1,2024-03-01 00:00:00,55.0,12.0,10.0,90.0,Cargo
100,1,2,2024-03-01 00:05:00,55.2,12.2,11.0,91.0,Cargo
200,2,1,2024-03-01 00:00:00,56.0,11.0,3.0,180.0,Tanker
200,2,1,2024-03-01 00:02:00,56.1,11.1,3.5,181.0,Tanker
";

fn knowledge_units() -> Value {
    json!([
        {
            "v_s": {"MMSI": 100, "seq": 1, "block": 1, "ship_type": "Cargo", "length": "large"},
            "v_b": {
                "speed_profile": "accelerating (strong)",
                "course_change": "straight",
                "heading_fluctuation": "low",
                "intent": "transit",
                "duration": "short",
                "llm_output": "The vessel leaves port and speeds up."
            },
            "v_f": {"spatial_function": "def f(): pass"}
        },
        {
            "v_s": {"MMSI": 100, "seq": "1", "block": "2", "ship_type": "Cargo"},
            "v_b": {
                "speed_profile": "steady",
                "course_change": "straight",
                "heading_fluctuation": "",
                "intent": "fishing",
                "duration": "long"
            }
        },
        null
    ])
}

fn imputations() -> Value {
    json!([
        {
            "mmsi": 100,
            "sequence_id": 1,
            "segment_id": 1,
            "behavior_estimator": {"graph_support": "strong"},
            "method_selector": {"statistical_support": "p<0.05"}
        }
    ])
}

fn sdkg_files() -> [(&'static str, Value); 5] {
    [
        (
            "SDK_graph_vb.json",
            json!({"SDK_graph_vb": {
                "vb_0001": {"vs_ship_type_Cargo": 3, "vs_length_large": 0},
                "vb_0002": {"vs_ship_type_Cargo": 1}
            }}),
        ),
        (
            "SDK_graph_vb_node.json",
            json!({"SDK_graph_vb_node": {
                "vb_0001": {
                    "speed_profile": "accelerating (strong)",
                    "course_change": "straight",
                    "heading_fluctuation": "low",
                    "intent": "transit",
                    "duration": "short"
                },
                "vb_0002": {
                    "speed_profile": "accelerating (mild)",
                    "course_change": "straight",
                    "heading_fluctuation": "low",
                    "intent": "transit (port)",
                    "duration": "short"
                }
            }}),
        ),
        (
            "SDK_graph_vf.json",
            json!({"SDK_graph_vf": {"vf_01": {"vb_0002": 1, "vb_0001": 0}}}),
        ),
        (
            "SDK_graph_vf_node.json",
            json!({"SDK_graph_vf_node": {
                "vf_01": {"description": "Computes the mean heading change over the segment", "code": "def f(): pass"}
            }}),
        ),
        (
            "SDK_graph_vs.json",
            json!({"SDK_graph_vs": {
                "ship_type": {"Cargo": ["vb_0001", "vb_0002"]},
                "length": {"large": ["vb_0001"]}
            }}),
        ),
    ]
}

fn write(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn write_value(path: &Path, value: &Value) {
    write(path, &serde_json::to_vec_pretty(value).unwrap());
}

/// Dataset entry with paths relative to the project root.
fn dataset_entry() -> DatasetConfig {
    DatasetConfig {
        name: DATASET.into(),
        points: "raw/points_{trajectory_len}_{trajectory_num}.csv".into(),
        knowledge_units: "ku/knowledge_units.json".into(),
        imputation_results: "ku/imputation_results.json".into(),
        behavior_graph: "sdkg/SDK_graph_vb.json".into(),
        behavior_nodes: "sdkg/SDK_graph_vb_node.json".into(),
        function_graph: "sdkg/SDK_graph_vf.json".into(),
        function_nodes: "sdkg/SDK_graph_vf_node.json".into(),
        attribute_graph: "sdkg/SDK_graph_vs.json".into(),
        output_dir: Some("out".into()),
    }
}

/// Write the fixture under a fresh temp dir and return a config that points
/// at it. Callers remove the dir when done.
pub fn dataset_config() -> (PathBuf, AppConfig) {
    let tmp = std::env::temp_dir().join(format!("ckg-fixture-{}", uuid::Uuid::now_v7()));

    let mut config = AppConfig::default();
    config.defaults.project_root = tmp.display().to_string();
    config.defaults.dataset = DATASET.into();
    config.datasets = vec![dataset_entry()];

    let inputs = config.resolve_inputs(DATASET, None, None).unwrap();
    write(&inputs.points, POINTS_CSV.as_bytes());
    write_value(&inputs.knowledge_units, &knowledge_units());
    write_value(&inputs.imputation_results, &imputations());
    let sdkg_dir = inputs.behavior_graph.parent().unwrap().to_path_buf();
    for (name, value) in sdkg_files() {
        write_value(&sdkg_dir.join(name), &value);
    }

    (tmp, config)
}

/// Same fixture, resolved to concrete input paths.
pub fn dataset_dir() -> (PathBuf, DatasetInputs) {
    let (tmp, config) = dataset_config();
    let inputs = config.resolve_inputs(DATASET, None, None).unwrap();
    (tmp, inputs)
}

/// The fixture loaded into memory.
pub fn graph_sources() -> GraphSources {
    let (tmp, inputs) = dataset_dir();
    let sources = GraphSources {
        tables: SdkgTables::load(
            &inputs.behavior_graph,
            &inputs.behavior_nodes,
            &inputs.function_graph,
            &inputs.function_nodes,
            &inputs.attribute_graph,
        )
        .unwrap(),
        units: inputs::load_knowledge_units(&inputs.knowledge_units).unwrap(),
        imputations: inputs::load_imputations(&inputs.imputation_results).unwrap(),
        points: inputs::load_points(&inputs.points).unwrap(),
    };
    let _ = std::fs::remove_dir_all(&tmp);
    sources
}
