//! Published tool catalog: names, descriptions and JSON input schemas.

use serde::Serialize;
use serde_json::{json, Value};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    QuerySensorReadings,
    GetSensorStatistics,
    ListEquipment,
    ListMetrics,
    GetLatestReadings,
    Query,
    ListTables,
    DescribeTable,
    Execute,
}

impl ToolName {
    pub const ALL: [ToolName; 9] = [
        ToolName::QuerySensorReadings,
        ToolName::GetSensorStatistics,
        ToolName::ListEquipment,
        ToolName::ListMetrics,
        ToolName::GetLatestReadings,
        ToolName::Query,
        ToolName::ListTables,
        ToolName::DescribeTable,
        ToolName::Execute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::QuerySensorReadings => "query_sensor_readings",
            ToolName::GetSensorStatistics => "get_sensor_statistics",
            ToolName::ListEquipment => "list_equipment",
            ToolName::ListMetrics => "list_metrics",
            ToolName::GetLatestReadings => "get_latest_readings",
            ToolName::Query => "query",
            ToolName::ListTables => "list_tables",
            ToolName::DescribeTable => "describe_table",
            ToolName::Execute => "execute",
        }
    }

    /// True for tools served by the time-series store.
    pub fn is_timeseries(&self) -> bool {
        matches!(
            self,
            ToolName::QuerySensorReadings
                | ToolName::GetSensorStatistics
                | ToolName::ListEquipment
                | ToolName::ListMetrics
                | ToolName::GetLatestReadings
        )
    }
}

impl FromStr for ToolName {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == value)
            .ok_or(())
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    ToolName::ALL.into_iter().map(definition).collect()
}

fn definition(tool: ToolName) -> ToolDefinition {
    let (description, input_schema) = match tool {
        ToolName::QuerySensorReadings => (
            "Query sensor readings from production equipment. Filters: equipment_name \
             (e.g. \"Neutralization Outlet\"), equipment_type (e.g. \"Pipeline\", \"Reactor\"), \
             metric (e.g. \"Conductivity\", \"Temperature\") and sensor_type (e.g. \
             \"Conductivity Sensor\"). Returns readings with timestamps and values, newest first.",
            object(
                json!({
                    "equipment_name": string("Equipment name (e.g., 'Neutralization Outlet')"),
                    "equipment_type": string("Equipment type (e.g., 'Pipeline', 'Reactor')"),
                    "metric": string("Metric type (e.g., 'Conductivity', 'Temperature', 'Pressure')"),
                    "sensor_type": string("Sensor type (e.g., 'Conductivity Sensor')"),
                    "start_time": string("Start time: relative (e.g., '-1h', '-24h') or ISO format. Default: -24h"),
                    "stop_time": string("Stop time: relative or ISO format. Default: now()"),
                    "limit": {
                        "type": "integer",
                        "description": "Maximum records to return. Default: 100",
                        "default": 100,
                    },
                }),
                &[],
            ),
        ),
        ToolName::GetSensorStatistics => (
            "Get statistical aggregations (mean, min, max, count) for sensor readings. \
             Useful for understanding sensor behavior and detecting anomalies.",
            object(
                json!({
                    "equipment_name": string("Equipment name to filter"),
                    "metric": string("Metric to aggregate (e.g., 'Conductivity')"),
                    "start_time": string("Start time for aggregation. Default: -24h"),
                    "stop_time": string("Stop time for aggregation. Default: now()"),
                    "window": string("Time window for grouping (e.g., '1h', '5m'). Optional."),
                }),
                &[],
            ),
        ),
        ToolName::ListEquipment => (
            "List all equipment that has reported sensor data. Returns unique equipment names and types.",
            object(
                json!({
                    "start_time": string("Look for equipment active since this time. Default: -7d"),
                }),
                &[],
            ),
        ),
        ToolName::ListMetrics => (
            "List all available metrics and sensor types. Returns unique metric names and sensor types.",
            object(
                json!({
                    "equipment_name": string("Filter by equipment name (optional)"),
                    "start_time": string("Look for metrics since this time. Default: -7d"),
                }),
                &[],
            ),
        ),
        ToolName::GetLatestReadings => (
            "Get the most recent sensor reading per equipment and metric from the last hour. \
             Useful for real-time monitoring and current status checks.",
            object(
                json!({
                    "equipment_name": string("Equipment name (optional)"),
                    "metric": string("Specific metric (optional)"),
                }),
                &[],
            ),
        ),
        ToolName::Query => (
            "Execute a SELECT query on the PostgreSQL database. Returns query results as JSON.",
            object(
                json!({
                    "sql": string("The SELECT SQL query to execute"),
                }),
                &["sql"],
            ),
        ),
        ToolName::ListTables => (
            "List all tables in the current database schema",
            object(
                json!({
                    "schema": schema_property(),
                }),
                &[],
            ),
        ),
        ToolName::DescribeTable => (
            "Get detailed information about a table's structure including columns, types, and constraints",
            object(
                json!({
                    "table_name": string("Name of the table to describe"),
                    "schema": schema_property(),
                }),
                &["table_name"],
            ),
        ),
        ToolName::Execute => (
            "Execute an INSERT, UPDATE, or DELETE query. Returns the number of affected rows.",
            object(
                json!({
                    "sql": string("The SQL query to execute (INSERT, UPDATE, DELETE)"),
                }),
                &["sql"],
            ),
        ),
    };

    ToolDefinition {
        name: tool.as_str(),
        description,
        input_schema,
    }
}

fn object(properties: Value, required: &[&str]) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": properties,
    });
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

fn string(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

fn schema_property() -> Value {
    json!({
        "type": "string",
        "description": "Schema name (default: public)",
        "default": "public",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for tool in ToolName::ALL {
            assert_eq!(tool.as_str().parse::<ToolName>(), Ok(tool));
        }
        assert!("drop_everything".parse::<ToolName>().is_err());
    }

    #[test]
    fn catalog_lists_every_tool_once() {
        let defs = tool_definitions();
        assert_eq!(defs.len(), 9);
        let names: Vec<_> = defs.iter().map(|d| d.name).collect();
        assert!(names.contains(&"get_latest_readings"));
        assert!(names.contains(&"describe_table"));
    }

    #[test]
    fn required_keys_are_published() {
        let defs = tool_definitions();
        let describe = defs.iter().find(|d| d.name == "describe_table").unwrap();
        assert_eq!(describe.input_schema["required"], json!(["table_name"]));

        let readings = defs
            .iter()
            .find(|d| d.name == "query_sensor_readings")
            .unwrap();
        assert!(readings.input_schema.get("required").is_none());
        assert_eq!(
            readings.input_schema["properties"]["limit"]["default"],
            json!(100)
        );
    }
}
