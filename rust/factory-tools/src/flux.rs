//! Flux query composition for the sensor telemetry tools.
//!
//! Every time-series tool builds its query from the same three parts: a base
//! selection (bucket, range, measurement), an ordered list of [`Predicate`]s
//! and a terminal [`Shape`]. Composition is pure; identical inputs render
//! byte-identical Flux.

use crate::time::{TimeBound, TimeRange};

pub const MEASUREMENT: &str = "sensor_data";
pub const FIELD: &str = "measurement";

/// Tag holding the sensor type. Exposed to callers as `sensor_type`.
pub const SENSOR_TYPE_TAG: &str = "type";

pub const STATISTICS_GROUP: &[&str] = &["equipment_name", "equipment_type", "metric", "type"];
pub const EQUIPMENT_GROUP: &[&str] = &["equipment_name", "equipment_type"];
pub const METRIC_GROUP: &[&str] = &["metric", "type"];
pub const LATEST_GROUP: &[&str] = &["equipment_name", "metric"];

const PIPE: &str = "\n  |> ";

/// One equality clause against a tag column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub column: &'static str,
    pub value: String,
}

impl Predicate {
    pub fn to_flux(&self) -> String {
        format!(
            "filter(fn: (r) => r[\"{}\"] == \"{}\")",
            self.column,
            escape_string(&self.value)
        )
    }
}

/// Builds predicates for the declared `(column, value)` pairs, in declared
/// order, skipping absent and empty values.
pub fn assemble(declared: &[(&'static str, Option<&str>)]) -> Vec<Predicate> {
    declared
        .iter()
        .filter_map(|&(column, value)| {
            let value = value.filter(|v| !v.is_empty())?;
            Some(Predicate {
                column,
                value: value.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub enum Range {
    Bounded(TimeRange),
    Since(TimeBound),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Newest first, capped at `limit` rows.
    Selection { limit: i64 },
    /// Running count/sum/min/max per sensor series.
    GroupedReduce,
    /// One representative row per group, projected to the group columns.
    GroupedFirst(&'static [&'static str]),
    /// Most recent row per equipment and metric.
    GroupedLast,
}

impl Shape {
    fn filters_field(&self) -> bool {
        !matches!(self, Shape::GroupedFirst(_))
    }
}

pub fn compose(bucket: &str, range: &Range, predicates: &[Predicate], shape: Shape) -> String {
    let mut query = String::new();
    if matches!(shape, Shape::GroupedReduce) {
        query.push_str("import \"math\"\n\n");
    }

    query.push_str(&format!("from(bucket: \"{}\")", escape_string(bucket)));
    query.push_str(PIPE);
    match range {
        Range::Bounded(TimeRange { start, stop }) => {
            query.push_str(&format!("range(start: {start}, stop: {stop})"));
        }
        Range::Since(start) => {
            query.push_str(&format!("range(start: {start})"));
        }
    }

    query.push_str(PIPE);
    query.push_str(&tag_filter("_measurement", MEASUREMENT));
    if shape.filters_field() {
        query.push_str(PIPE);
        query.push_str(&tag_filter("_field", FIELD));
    }

    for predicate in predicates {
        query.push_str(PIPE);
        query.push_str(&predicate.to_flux());
    }

    match shape {
        Shape::Selection { limit } => {
            query.push_str(PIPE);
            query.push_str("sort(columns: [\"_time\"], desc: true)");
            query.push_str(PIPE);
            query.push_str(&format!("limit(n: {limit})"));
        }
        Shape::GroupedReduce => {
            query.push_str(PIPE);
            query.push_str(&group(STATISTICS_GROUP));
            query.push_str(PIPE);
            query.push_str(REDUCE_STEP);
            query.push_str(PIPE);
            query.push_str(STATISTICS_MAP_STEP);
        }
        Shape::GroupedFirst(columns) => {
            query.push_str(PIPE);
            query.push_str(&group(columns));
            query.push_str(PIPE);
            query.push_str("first()");
            query.push_str(PIPE);
            query.push_str(&format!("keep(columns: {})", column_list(columns)));
        }
        Shape::GroupedLast => {
            query.push_str(PIPE);
            query.push_str(&group(LATEST_GROUP));
            query.push_str(PIPE);
            query.push_str("last()");
        }
    }

    query
}

const REDUCE_STEP: &str = "reduce(
      identity: {count: 0.0, sum: 0.0, min: math.mInf(sign: 1), max: math.mInf(sign: -1)},
      fn: (r, accumulator) => ({
        count: accumulator.count + 1.0,
        sum: accumulator.sum + r._value,
        min: if r._value < accumulator.min then r._value else accumulator.min,
        max: if r._value > accumulator.max then r._value else accumulator.max
      })
    )";

const STATISTICS_MAP_STEP: &str = "map(fn: (r) => ({
      equipment_name: r.equipment_name,
      equipment_type: r.equipment_type,
      metric: r.metric,
      sensor_type: r.type,
      count: r.count,
      sum: r.sum,
      mean: r.sum / r.count,
      min: r.min,
      max: r.max
    }))";

fn tag_filter(column: &str, value: &str) -> String {
    format!("filter(fn: (r) => r[\"{column}\"] == \"{value}\")")
}

fn group(columns: &[&str]) -> String {
    format!("group(columns: {})", column_list(columns))
}

fn column_list(columns: &[&str]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    format!("[{}]", quoted.join(", "))
}

/// Keeps a caller value inside a single Flux string literal.
fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    out
}
