//! Grouped running statistics for `get_sensor_statistics`.

use crate::models::{AggregateRecord, SeriesKey};
use std::collections::HashMap;

/// Running count/sum/min/max for one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl RunningStats {
    pub const SEED: RunningStats = RunningStats {
        count: 0,
        sum: 0.0,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };

    /// Per-point update. The server-side `reduce` step applies the same fold,
    /// so a partial built here merges exactly like one read from the backend.
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// Folds in a partial state computed elsewhere (e.g. by the backend's `reduce`).
    pub fn merge(&mut self, partial: &RunningStats) {
        if partial.count == 0 {
            return;
        }
        self.count += partial.count;
        self.sum += partial.sum;
        if partial.min < self.min {
            self.min = partial.min;
        }
        if partial.max > self.max {
            self.max = partial.max;
        }
    }
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::SEED
    }
}

/// Accumulates [`RunningStats`] per series, remembering first-seen order.
#[derive(Debug, Default)]
pub struct GroupedReducer {
    groups: Vec<(SeriesKey, RunningStats)>,
    index: HashMap<SeriesKey, usize>,
}

impl GroupedReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a single point into its group without a backend partial.
    pub fn observe(&mut self, key: SeriesKey, value: f64) {
        self.slot(key).observe(value);
    }

    pub fn merge(&mut self, key: SeriesKey, partial: &RunningStats) {
        self.slot(key).merge(partial);
    }

    fn slot(&mut self, key: SeriesKey) -> &mut RunningStats {
        let idx = match self.index.get(&key) {
            Some(idx) => *idx,
            None => {
                let idx = self.groups.len();
                self.index.insert(key.clone(), idx);
                self.groups.push((key, RunningStats::SEED));
                idx
            }
        };
        &mut self.groups[idx].1
    }

    /// Emits one record per non-empty group. The mean is divided out here,
    /// once, from the accumulated sum.
    pub fn finish(self) -> Vec<AggregateRecord> {
        self.groups
            .into_iter()
            .filter(|(_, stats)| stats.count > 0)
            .map(|(key, stats)| AggregateRecord {
                equipment_name: key.equipment_name,
                equipment_type: key.equipment_type,
                metric: key.metric,
                sensor_type: key.sensor_type,
                count: stats.count,
                mean: round4(stats.sum / stats.count as f64),
                min: round4(stats.min),
                max: round4(stats.max),
            })
            .collect()
    }
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
