//! Segment Extractor: raw point table → per-segment polylines (`segments.json`).

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::{debug, info, instrument};

use clearkg_shared::{Result, SegmentRecord, TrackPoint};

use crate::artifacts::{OutputLayout, write_json};
use crate::inputs::{self, PointRow};
use crate::pipeline::{ProgressReporter, StageReport};

/// A segment needs at least this many points to form a polyline.
pub const MIN_SEGMENT_POINTS: usize = 2;

/// Normalize a table timestamp (`2024-03-01 00:00:00`) to ISO-8601 UTC.
pub fn iso_timestamp(raw: &str) -> String {
    let ts = raw.trim().replace(' ', "T");
    if ts.ends_with('Z') { ts } else { format!("{ts}Z") }
}

/// Group rows into segment records.
///
/// When `keep` is given, rows whose `(mmsi, sequence_id)` is not in the set
/// are dropped first. Groups are emitted in `(sequence_id, segment_id)`
/// order; points within a group are sorted by timestamp.
pub fn build_segments(rows: &[PointRow], keep: Option<&HashSet<(i64, i64)>>) -> Vec<SegmentRecord> {
    let mut groups: BTreeMap<(i64, i64), Vec<&PointRow>> = BTreeMap::new();
    for row in rows {
        if keep.is_some_and(|pairs| !pairs.contains(&row.trajectory_key())) {
            continue;
        }
        groups
            .entry((row.sequence_id, row.segment_id))
            .or_default()
            .push(row);
    }

    let mut segments = Vec::with_capacity(groups.len());
    for ((seq_id, seg_id), mut group) in groups {
        if group.len() < MIN_SEGMENT_POINTS {
            debug!(seq_id, seg_id, points = group.len(), "segment too short, skipped");
            continue;
        }
        group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let first = group[0];
        let last = group[group.len() - 1];
        let ship_type = first.ship_type.as_deref().unwrap_or("Unknown");

        segments.push(SegmentRecord {
            id: format!("TRJ_{seq_id}_SEG_{seg_id}"),
            trajectory_id: format!("TRJ_{seq_id}"),
            vessel_id: first.mmsi.to_string(),
            start_time: iso_timestamp(&first.timestamp),
            end_time: iso_timestamp(&last.timestamp),
            short_description: format!("{ship_type} vessel {} trajectory segment", first.mmsi),
            points: group
                .iter()
                .map(|row| TrackPoint {
                    timestamp: iso_timestamp(&row.timestamp),
                    lat: row.latitude,
                    lon: row.longitude,
                    sog: row.sog,
                    cog: row.cog,
                })
                .collect(),
        });
    }
    segments
}

/// Run the Segment Extractor stage.
///
/// A missing knowledge-unit file, or one naming no trajectories, disables
/// filtering.
#[instrument(skip_all, fields(points = %points.display()))]
pub fn extract_segments(
    points: &Path,
    knowledge_units: &Path,
    layout: &OutputLayout,
    progress: &dyn ProgressReporter,
) -> Result<StageReport> {
    progress.update(15.0, "Start converting CSV data");

    progress.update(35.0, "Read CSV file");
    let rows = inputs::load_points(points)?;

    let pairs = if knowledge_units.exists() {
        progress.update(50.0, "Read KU file and filter data");
        let units = inputs::load_knowledge_units(knowledge_units)?;
        let pairs = inputs::trajectory_pairs(&units);
        info!(trajectories = pairs.len(), "filtering points to knowledge units");
        Some(pairs).filter(|p| !p.is_empty())
    } else {
        debug!(path = %knowledge_units.display(), "no knowledge-unit file, keeping all rows");
        None
    };

    progress.update(65.0, "Processing trajectory segments");
    let segments = build_segments(&rows, pairs.as_ref());

    let output = layout.segments_file();
    write_json(&output, &segments)?;

    progress.update(100.0, "CSV conversion completed");
    info!(rows = rows.len(), segments = segments.len(), "segment extraction complete");

    Ok(StageReport {
        message: format!("Conversion Complete: {} segments", segments.len()),
        outputs: vec![output],
        stats: None,
    })
}
