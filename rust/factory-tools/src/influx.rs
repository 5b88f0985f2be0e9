//! InfluxDB 2.x query client and annotated-CSV decoding.

use crate::{
    backend::{TimeSeriesSession, TimeSeriesSource},
    config::InfluxConfig,
    error::{Result, ServiceError},
};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// One row of a Flux result table, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FluxRecord {
    values: Map<String, Value>,
}

impl FluxRecord {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(values) => Self { values },
            _ => Self::default(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column).filter(|v| !v.is_null())
    }

    pub fn get_string(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        match self.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// `_time` as an RFC 3339 instant with an explicit offset.
    pub fn time(&self) -> Option<String> {
        let raw = self.get_string("_time")?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(dt) => Some(dt.to_rfc3339()),
            Err(_) => Some(raw),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FluxTable {
    pub records: Vec<FluxRecord>,
}

/// Flattens tables into their records, table order first.
pub fn records(tables: &[FluxTable]) -> impl Iterator<Item = &FluxRecord> {
    tables.iter().flat_map(|table| table.records.iter())
}

#[derive(Clone)]
pub struct InfluxSource {
    config: Arc<InfluxConfig>,
    timeout: Duration,
}

impl InfluxSource {
    pub fn new(config: InfluxConfig, timeout: Duration) -> Self {
        Self {
            config: Arc::new(config),
            timeout,
        }
    }
}

#[async_trait]
impl TimeSeriesSource for InfluxSource {
    async fn connect(&self) -> Result<Box<dyn TimeSeriesSession>> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| ServiceError::Connection(err.to_string()))?;
        debug!(url = %self.config.url, "InfluxDB session opened");
        Ok(Box::new(InfluxSession {
            client,
            config: Arc::clone(&self.config),
        }))
    }
}

pub struct InfluxSession {
    client: Client,
    config: Arc<InfluxConfig>,
}

#[derive(Deserialize)]
struct InfluxErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

#[async_trait]
impl TimeSeriesSession for InfluxSession {
    async fn query(&mut self, flux: &str) -> Result<Vec<FluxTable>> {
        let response = self
            .client
            .post(format!("{}/api/v2/query", self.config.url))
            .query(&[("org", self.config.org.as_str())])
            .header(header::AUTHORIZATION, format!("Token {}", self.config.token))
            .header(header::ACCEPT, "application/csv")
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": {
                    "header": true,
                    "annotations": ["datatype", "group", "default"],
                },
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = match serde_json::from_str::<InfluxErrorBody>(&body) {
                Ok(InfluxErrorBody {
                    code: Some(code),
                    message,
                }) => format!("{code}: {message}"),
                Ok(InfluxErrorBody { message, .. }) => message,
                Err(_) => format!("InfluxDB returned status {status}"),
            };
            return Err(ServiceError::Backend(message));
        }

        decode_annotated_csv(&body)
    }
}

impl Drop for InfluxSession {
    fn drop(&mut self) {
        debug!("InfluxDB session released");
    }
}

#[derive(Default)]
struct Block {
    datatypes: Vec<String>,
    defaults: Vec<String>,
    header: Option<Vec<String>>,
}

/// Decodes the annotated CSV dialect of `/api/v2/query` into tables.
///
/// Values are typed by the `#datatype` annotation and empty cells take the
/// `#default` annotation. A result carrying `error`/`reference` columns is
/// turned into a backend error.
pub fn decode_annotated_csv(body: &str) -> Result<Vec<FluxTable>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut tables: Vec<FluxTable> = Vec::new();
    let mut block = Block::default();
    let mut block_id = 0usize;
    let mut current: Option<(usize, String)> = None;
    let mut in_annotations = false;

    for row in reader.records() {
        let row = row.map_err(|err| ServiceError::Backend(format!("malformed Flux CSV: {err}")))?;
        let fields: Vec<&str> = row.iter().collect();

        if fields.iter().all(|f| f.is_empty()) {
            block = Block::default();
            in_annotations = false;
            continue;
        }

        if let Some(annotation) = fields[0].strip_prefix('#') {
            if !in_annotations {
                block = Block::default();
                block_id += 1;
                in_annotations = true;
            }
            match annotation {
                "datatype" => block.datatypes = owned(&fields),
                "default" => block.defaults = owned(&fields),
                _ => {}
            }
            continue;
        }
        in_annotations = false;

        let Some(header) = block.header.as_ref() else {
            if block.datatypes.is_empty() {
                block_id += 1;
            }
            block.header = Some(owned(&fields));
            continue;
        };

        if header.iter().any(|h| h == "error") && header.iter().any(|h| h == "reference") {
            let idx = header.iter().position(|h| h == "error").unwrap_or_default();
            let message = fields.get(idx).copied().unwrap_or("unknown Flux error");
            return Err(ServiceError::Backend(message.to_string()));
        }

        let mut values = Map::new();
        for (idx, column) in header.iter().enumerate() {
            if column.is_empty() {
                continue;
            }
            let mut raw = fields.get(idx).copied().unwrap_or_default();
            if raw.is_empty() {
                raw = block.defaults.get(idx).map(String::as_str).unwrap_or_default();
            }
            let datatype = block.datatypes.get(idx).map(String::as_str).unwrap_or("string");
            values.insert(column.clone(), typed_value(datatype, raw));
        }

        let table_id = values
            .get("table")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let key = (block_id, table_id);
        if current.as_ref() != Some(&key) {
            tables.push(FluxTable::default());
            current = Some(key);
        }
        if let Some(table) = tables.last_mut() {
            table.records.push(FluxRecord { values });
        }
    }

    Ok(tables)
}

fn owned(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

fn typed_value(datatype: &str, raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    match datatype {
        "long" => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        "unsignedLong" => raw
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        "double" => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "boolean" => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        _ => Value::String(raw.to_string()),
    }
}
