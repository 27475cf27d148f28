//! World statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of world statistics, as returned by [`World::info`](crate::World::info).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorldInfo {
    pub frame_count_total: u64,
    /// Scaled delta time of the last frame.
    pub delta_time: f32,
    /// Delta time of the last frame before scaling.
    pub delta_time_raw: f32,
    pub time_scale: f32,
    pub target_fps: f32,
    pub world_time_total: f64,
    pub world_time_total_raw: f64,
    /// Time spent between frame begin and end, when measured.
    pub frame_time_total: f64,
    /// Time spent inside systems, when measured.
    pub system_time_total: f64,
    pub merge_count_total: u64,
    /// Commands applied by all merges.
    pub commands_merged_total: u64,
    pub pipeline_build_count_total: u64,
    /// Systems run by the main thread in the last frame.
    pub systems_ran_frame: u64,
}

/// Counters updated from any thread.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) merge_count_total: AtomicU64,
    pub(crate) commands_merged_total: AtomicU64,
    pub(crate) pipeline_build_count_total: AtomicU64,
    pub(crate) systems_ran_frame: AtomicU64,
    pub(crate) system_time_total_ns: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_serializes_all_fields() {
        let info = WorldInfo {
            frame_count_total: 3,
            merge_count_total: 7,
            ..WorldInfo::default()
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["frame_count_total"], 3);
        assert_eq!(value["merge_count_total"], 7);
        assert!(value.get("pipeline_build_count_total").is_some());
        assert!(value.get("commands_merged_total").is_some());
        assert!(value.get("systems_ran_frame").is_some());
    }
}
