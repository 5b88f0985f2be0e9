//! Flat record shapes returned by the time-series tools.

use crate::{flux::SENSOR_TYPE_TAG, influx::FluxRecord, stats::RunningStats};
use serde::Serialize;
use std::{collections::HashSet, hash::Hash};

/// One sensor reading. Every field is always serialized; missing tags are `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub timestamp: Option<String>,
    pub equipment_name: Option<String>,
    pub equipment_type: Option<String>,
    pub metric: Option<String>,
    pub sensor_type: Option<String>,
    pub value: Option<f64>,
}

impl SensorReading {
    pub fn from_record(record: &FluxRecord) -> Self {
        Self {
            timestamp: record.time(),
            equipment_name: record.get_string("equipment_name"),
            equipment_type: record.get_string("equipment_type"),
            metric: record.get_string("metric"),
            sensor_type: record.get_string(SENSOR_TYPE_TAG),
            value: record.get_f64("_value"),
        }
    }
}

/// Identity of one sensor series for statistics grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub equipment_name: Option<String>,
    pub equipment_type: Option<String>,
    pub metric: Option<String>,
    pub sensor_type: Option<String>,
}

impl SeriesKey {
    /// Reads the key from a mapped statistics row, where the sensor type tag
    /// has already been renamed to `sensor_type`.
    pub fn from_statistics_record(record: &FluxRecord) -> Self {
        Self {
            equipment_name: record.get_string("equipment_name"),
            equipment_type: record.get_string("equipment_type"),
            metric: record.get_string("metric"),
            sensor_type: record.get_string("sensor_type"),
        }
    }
}

/// Partial running state carried by one statistics row, if it has one.
pub fn partial_stats(record: &FluxRecord) -> Option<RunningStats> {
    let count = record.get_f64("count")?;
    if !count.is_finite() || count < 1.0 {
        return None;
    }
    Some(RunningStats {
        count: count.round() as u64,
        sum: record.get_f64("sum")?,
        min: record.get_f64("min")?,
        max: record.get_f64("max")?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRecord {
    pub equipment_name: Option<String>,
    pub equipment_type: Option<String>,
    pub metric: Option<String>,
    pub sensor_type: Option<String>,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquipmentEntry {
    pub equipment_name: String,
    pub equipment_type: Option<String>,
}

impl EquipmentEntry {
    pub fn from_record(record: &FluxRecord) -> Option<Self> {
        Some(Self {
            equipment_name: record.get_string("equipment_name").filter(|n| !n.is_empty())?,
            equipment_type: record.get_string("equipment_type"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricEntry {
    pub metric: String,
    pub sensor_type: Option<String>,
}

impl MetricEntry {
    pub fn from_record(record: &FluxRecord) -> Option<Self> {
        Some(Self {
            metric: record.get_string("metric").filter(|m| !m.is_empty())?,
            sensor_type: record.get_string(SENSOR_TYPE_TAG),
        })
    }
}

/// Drops repeats of an identity key; the first occurrence wins and order is kept.
pub fn dedup_first_seen<T, K, F>(items: impl IntoIterator<Item = T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect()
}
