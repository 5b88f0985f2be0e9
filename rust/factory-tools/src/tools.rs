//! Tool dispatch: routes a named call to one adapter operation and renders
//! the outcome as a single text block.

use crate::{
    backend::{RelationalSession, RelationalSource, TimeSeriesSession, TimeSeriesSource},
    catalog::ToolName,
    config::AppConfig,
    error::{Result, ServiceError},
    flux::{self, Range, Shape, SENSOR_TYPE_TAG},
    influx::records,
    models::{
        dedup_first_seen, partial_stats, EquipmentEntry, MetricEntry, SensorReading, SeriesKey,
    },
    statement::{admit, StatementClass},
    stats::GroupedReducer,
    time::{self, TimeRange},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_SCHEMA: &str = "public";

const LIST_TABLES_SQL: &str = "SELECT table_name::text AS table_name, table_type::text AS table_type
FROM information_schema.tables
WHERE table_schema::text = $1
ORDER BY table_name";

const DESCRIBE_COLUMNS_SQL: &str = "SELECT
    column_name::text AS column_name,
    data_type::text AS data_type,
    character_maximum_length::int4 AS character_maximum_length,
    is_nullable::text AS is_nullable,
    column_default::text AS column_default
FROM information_schema.columns
WHERE table_schema::text = $1 AND table_name::text = $2
ORDER BY ordinal_position";

const DESCRIBE_CONSTRAINTS_SQL: &str = "SELECT
    tc.constraint_name::text AS constraint_name,
    tc.constraint_type::text AS constraint_type,
    kcu.column_name::text AS column_name
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
    ON tc.constraint_name = kcu.constraint_name
    AND tc.table_schema = kcu.table_schema
WHERE tc.table_schema::text = $1 AND tc.table_name::text = $2
ORDER BY tc.constraint_name, kcu.ordinal_position";

/// Result of one tool call: always exactly one text block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

impl ToolResponse {
    fn json(payload: &Value, is_error: bool) -> Self {
        let text = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
        Self {
            content: vec![ContentBlock::Text { text }],
            is_error,
        }
    }

    /// Text of the single content block.
    pub fn text(&self) -> &str {
        match self.content.first() {
            Some(ContentBlock::Text { text }) => text,
            None => "",
        }
    }

    /// Parses the text block back into JSON.
    pub fn payload(&self) -> Value {
        serde_json::from_str(self.text()).unwrap_or(Value::Null)
    }
}

#[derive(Clone)]
pub struct ToolDispatcher {
    config: Arc<AppConfig>,
    timeseries: Arc<dyn TimeSeriesSource>,
    relational: Arc<dyn RelationalSource>,
}

impl ToolDispatcher {
    pub fn new(
        config: Arc<AppConfig>,
        timeseries: Arc<dyn TimeSeriesSource>,
        relational: Arc<dyn RelationalSource>,
    ) -> Self {
        Self {
            config,
            timeseries,
            relational,
        }
    }

    /// Runs one tool call. Failures never escape: they come back as an
    /// `{error, tool, arguments}` payload.
    pub async fn call(&self, name: &str, arguments: Value) -> ToolResponse {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let call_id = Uuid::new_v4();
        info!(%call_id, tool = name, arguments = %arguments, "tool called");

        match self.dispatch(name, &arguments).await {
            Ok(payload) => ToolResponse::json(&payload, false),
            Err(err) => {
                let message = format!("Error executing {name}: {err}");
                if err.is_rejection() {
                    warn!(%call_id, tool = name, error = %err, "tool call rejected");
                } else {
                    error!(%call_id, tool = name, error = %err, "tool call failed");
                }
                ToolResponse::json(
                    &json!({
                        "error": message,
                        "tool": name,
                        "arguments": arguments,
                    }),
                    true,
                )
            }
        }
    }

    async fn dispatch(&self, name: &str, arguments: &Value) -> Result<Value> {
        let tool: ToolName = name
            .parse()
            .map_err(|_| ServiceError::UnknownTool(name.to_string()))?;

        if tool.is_timeseries() {
            let mut session = self.timeseries.connect().await?;
            self.run_timeseries(tool, session.as_mut(), arguments).await
        } else {
            let mut session = self.relational.acquire().await?;
            self.run_relational(tool, session.as_mut(), arguments).await
        }
    }

    async fn run_timeseries(
        &self,
        tool: ToolName,
        session: &mut dyn TimeSeriesSession,
        arguments: &Value,
    ) -> Result<Value> {
        let bucket = self.config.influx.bucket.as_str();
        match tool {
            ToolName::QuerySensorReadings => {
                let args: ReadingsArgs = parse_args(arguments)?;
                let range = time::resolve(
                    args.start_time.as_deref(),
                    args.stop_time.as_deref(),
                    time::DEFAULT_LOOKBACK,
                )?;
                let limit = clamp_limit(args.limit, &self.config);
                let predicates = flux::assemble(&[
                    ("equipment_name", args.equipment_name.as_deref()),
                    ("equipment_type", args.equipment_type.as_deref()),
                    ("metric", args.metric.as_deref()),
                    (SENSOR_TYPE_TAG, args.sensor_type.as_deref()),
                ]);
                let query = flux::compose(
                    bucket,
                    &Range::Bounded(range.clone()),
                    &predicates,
                    Shape::Selection { limit },
                );
                debug!(flux = %query, "executing sensor readings query");

                let tables = session.query(&query).await?;
                let data: Vec<SensorReading> =
                    records(&tables).map(SensorReading::from_record).collect();
                info!(count = data.len(), "sensor readings returned");

                Ok(json!({
                    "count": data.len(),
                    "query_params": {
                        "equipment_name": args.equipment_name,
                        "equipment_type": args.equipment_type,
                        "metric": args.metric,
                        "sensor_type": args.sensor_type,
                        "time_range": range,
                    },
                    "data": data,
                }))
            }
            ToolName::GetSensorStatistics => {
                let args: StatisticsArgs = parse_args(arguments)?;
                let range = time::resolve(
                    args.start_time.as_deref(),
                    args.stop_time.as_deref(),
                    time::DEFAULT_LOOKBACK,
                )?;
                let predicates = flux::assemble(&[
                    ("equipment_name", args.equipment_name.as_deref()),
                    ("metric", args.metric.as_deref()),
                ]);
                let query = flux::compose(
                    bucket,
                    &Range::Bounded(range.clone()),
                    &predicates,
                    Shape::GroupedReduce,
                );
                debug!(flux = %query, "executing statistics query");

                let tables = session.query(&query).await?;
                let mut reducer = GroupedReducer::new();
                for record in records(&tables) {
                    if let Some(partial) = partial_stats(record) {
                        reducer.merge(SeriesKey::from_statistics_record(record), &partial);
                    }
                }
                let statistics = reducer.finish();
                info!(count = statistics.len(), "sensor statistics calculated");

                Ok(json!({
                    "count": statistics.len(),
                    "statistics": statistics,
                    "time_range": range,
                    "window": args.window,
                }))
            }
            ToolName::ListEquipment => {
                let args: InventoryArgs = parse_args(arguments)?;
                let start = time::resolve_start(args.start_time.as_deref(), time::INVENTORY_LOOKBACK);
                let query = flux::compose(
                    bucket,
                    &Range::Since(start),
                    &[],
                    Shape::GroupedFirst(flux::EQUIPMENT_GROUP),
                );
                debug!(flux = %query, "executing equipment listing");

                let tables = session.query(&query).await?;
                let equipment = dedup_first_seen(
                    records(&tables).filter_map(EquipmentEntry::from_record),
                    |entry| entry.equipment_name.clone(),
                );
                info!(count = equipment.len(), "equipment listed");

                Ok(json!({
                    "count": equipment.len(),
                    "equipment": equipment,
                }))
            }
            ToolName::ListMetrics => {
                let args: InventoryArgs = parse_args(arguments)?;
                let start = time::resolve_start(args.start_time.as_deref(), time::INVENTORY_LOOKBACK);
                let predicates =
                    flux::assemble(&[("equipment_name", args.equipment_name.as_deref())]);
                let query = flux::compose(
                    bucket,
                    &Range::Since(start),
                    &predicates,
                    Shape::GroupedFirst(flux::METRIC_GROUP),
                );
                debug!(flux = %query, "executing metric listing");

                let tables = session.query(&query).await?;
                let metrics = dedup_first_seen(
                    records(&tables).filter_map(MetricEntry::from_record),
                    |entry| entry.metric.clone(),
                );
                info!(count = metrics.len(), "metrics listed");

                Ok(json!({
                    "count": metrics.len(),
                    "metrics": metrics,
                }))
            }
            ToolName::GetLatestReadings => {
                // Caller-supplied ranges are ignored here.
                let args: LatestArgs = parse_args(arguments)?;
                let predicates = flux::assemble(&[
                    ("equipment_name", args.equipment_name.as_deref()),
                    ("metric", args.metric.as_deref()),
                ]);
                let query = flux::compose(
                    bucket,
                    &Range::Bounded(TimeRange::fixed(time::LATEST_WINDOW)),
                    &predicates,
                    Shape::GroupedLast,
                );
                debug!(flux = %query, "executing latest readings query");

                let tables = session.query(&query).await?;
                let readings: Vec<SensorReading> =
                    records(&tables).map(SensorReading::from_record).collect();
                info!(count = readings.len(), "latest readings returned");

                Ok(json!({
                    "count": readings.len(),
                    "readings": readings,
                }))
            }
            _ => Err(ServiceError::UnknownTool(tool.to_string())),
        }
    }

    async fn run_relational(
        &self,
        tool: ToolName,
        session: &mut dyn RelationalSession,
        arguments: &Value,
    ) -> Result<Value> {
        match tool {
            ToolName::Query => {
                let args: StatementArgs = parse_args(arguments)?;
                admit(&args.sql, StatementClass::Read)?;
                let rows = session.query(&args.sql, &[]).await?;
                info!(count = rows.len(), "query returned rows");

                Ok(json!({
                    "count": rows.len(),
                    "rows": rows,
                }))
            }
            ToolName::ListTables => {
                let args: SchemaArgs = parse_args(arguments)?;
                let schema = args.schema_or_default();
                let tables = session.query(LIST_TABLES_SQL, &[schema]).await?;
                info!(schema, count = tables.len(), "tables listed");

                Ok(json!({
                    "schema": schema,
                    "count": tables.len(),
                    "tables": tables,
                }))
            }
            ToolName::DescribeTable => {
                let args: DescribeArgs = parse_args(arguments)?;
                if args.table_name.trim().is_empty() {
                    return Err(ServiceError::InvalidArguments(
                        "table_name must not be empty".to_string(),
                    ));
                }
                let schema = args
                    .schema
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_SCHEMA);
                let columns = session
                    .query(DESCRIBE_COLUMNS_SQL, &[schema, args.table_name.as_str()])
                    .await?;
                let constraints = session
                    .query(DESCRIBE_CONSTRAINTS_SQL, &[schema, args.table_name.as_str()])
                    .await?;
                info!(
                    schema,
                    table = %args.table_name,
                    columns = columns.len(),
                    constraints = constraints.len(),
                    "table described"
                );

                Ok(json!({
                    "schema": schema,
                    "table_name": args.table_name,
                    "count": columns.len(),
                    "columns": columns,
                    "constraints": constraints,
                }))
            }
            ToolName::Execute => {
                let args: StatementArgs = parse_args(arguments)?;
                admit(&args.sql, StatementClass::Write)?;
                let rows_affected = session.execute(&args.sql).await?;
                info!(rows_affected, "statement executed");

                Ok(json!({
                    "rows_affected": rows_affected,
                    "message": format!("Query executed successfully. Rows affected: {rows_affected}"),
                }))
            }
            _ => Err(ServiceError::UnknownTool(tool.to_string())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReadingsArgs {
    equipment_name: Option<String>,
    equipment_type: Option<String>,
    metric: Option<String>,
    sensor_type: Option<String>,
    start_time: Option<String>,
    stop_time: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatisticsArgs {
    equipment_name: Option<String>,
    metric: Option<String>,
    start_time: Option<String>,
    stop_time: Option<String>,
    window: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InventoryArgs {
    equipment_name: Option<String>,
    start_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LatestArgs {
    equipment_name: Option<String>,
    metric: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementArgs {
    sql: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SchemaArgs {
    schema: Option<String>,
}

impl SchemaArgs {
    fn schema_or_default(&self) -> &str {
        self.schema
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SCHEMA)
    }
}

#[derive(Debug, Deserialize)]
struct DescribeArgs {
    table_name: String,
    #[serde(default)]
    schema: Option<String>,
}

fn parse_args<T: DeserializeOwned>(arguments: &Value) -> Result<T> {
    T::deserialize(arguments).map_err(|err| ServiceError::InvalidArguments(err.to_string()))
}

/// Applies the configured default and keeps the row count within `1..=max_limit`.
fn clamp_limit(requested: Option<i64>, config: &AppConfig) -> i64 {
    requested
        .unwrap_or(config.default_limit)
        .min(config.max_limit)
        .max(1)
}
