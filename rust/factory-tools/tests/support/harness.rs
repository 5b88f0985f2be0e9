use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use factory_tools::{
    backend::{
        RelationalRow, RelationalSession, RelationalSource, TimeSeriesSession, TimeSeriesSource,
    },
    config::{AppConfig, InfluxConfig},
    error::{Result, ServiceError},
    influx::{FluxRecord, FluxTable},
    server::Server,
    tools::ToolDispatcher,
};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, Once,
};
use tower::ServiceExt;

static TRACING_INIT: Once = Once::new();

pub const BUCKET: &str = "44";

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub fn test_config() -> AppConfig {
    AppConfig::embedded(
        "postgres://factory@localhost/unused".to_string(),
        InfluxConfig {
            url: "http://influx.invalid".to_string(),
            token: "test-token".to_string(),
            org: "plant".to_string(),
            bucket: BUCKET.to_string(),
        },
    )
}

/// Tracks how many sessions were opened and how many were dropped again.
#[derive(Debug, Default)]
pub struct SessionCounter {
    opened: AtomicUsize,
    released: AtomicUsize,
}

impl SessionCounter {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Every opened session has been released.
    pub fn balanced(&self) -> bool {
        self.opened() == self.released()
    }
}

struct Release(Arc<SessionCounter>);

impl Release {
    fn open(counter: &Arc<SessionCounter>) -> Self {
        counter.opened.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory time-series store returning canned tables and recording Flux.
#[derive(Default)]
pub struct FakeTimeSeries {
    tables: Vec<FluxTable>,
    query_error: Option<String>,
    connect_error: Option<String>,
    pub counter: Arc<SessionCounter>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl FakeTimeSeries {
    pub fn with_tables(tables: Vec<FluxTable>) -> Self {
        Self {
            tables,
            ..Self::default()
        }
    }

    pub fn failing_query(message: &str) -> Self {
        Self {
            query_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn unreachable(message: &str) -> Self {
        Self {
            connect_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().expect("query log poisoned").clone()
    }

    pub fn last_query(&self) -> String {
        self.queries().pop().expect("at least one Flux query")
    }
}

#[async_trait]
impl TimeSeriesSource for FakeTimeSeries {
    async fn connect(&self) -> Result<Box<dyn TimeSeriesSession>> {
        if let Some(message) = &self.connect_error {
            return Err(ServiceError::Connection(message.clone()));
        }
        Ok(Box::new(FakeTimeSeriesSession {
            tables: self.tables.clone(),
            query_error: self.query_error.clone(),
            queries: Arc::clone(&self.queries),
            _release: Release::open(&self.counter),
        }))
    }
}

struct FakeTimeSeriesSession {
    tables: Vec<FluxTable>,
    query_error: Option<String>,
    queries: Arc<Mutex<Vec<String>>>,
    _release: Release,
}

#[async_trait]
impl TimeSeriesSession for FakeTimeSeriesSession {
    async fn query(&mut self, flux: &str) -> Result<Vec<FluxTable>> {
        self.queries
            .lock()
            .expect("query log poisoned")
            .push(flux.to_string());
        match &self.query_error {
            Some(message) => Err(ServiceError::Backend(message.clone())),
            None => Ok(self.tables.clone()),
        }
    }
}

/// One statement seen by [`FakeRelational`], with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<String>,
}

/// In-memory relational store. Every row-returning statement yields `rows`.
#[derive(Default)]
pub struct FakeRelational {
    rows: Vec<RelationalRow>,
    rows_affected: u64,
    query_error: Option<String>,
    pub counter: Arc<SessionCounter>,
    statements: Arc<Mutex<Vec<Statement>>>,
}

impl FakeRelational {
    pub fn with_rows(rows: Vec<Value>) -> Self {
        Self {
            rows: rows.into_iter().filter_map(|row| row.as_object().cloned()).collect(),
            ..Self::default()
        }
    }

    pub fn affecting(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    pub fn failing_query(message: &str) -> Self {
        Self {
            query_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().expect("statement log poisoned").clone()
    }
}

#[async_trait]
impl RelationalSource for FakeRelational {
    async fn acquire(&self) -> Result<Box<dyn RelationalSession>> {
        Ok(Box::new(FakeRelationalSession {
            rows: self.rows.clone(),
            rows_affected: self.rows_affected,
            query_error: self.query_error.clone(),
            statements: Arc::clone(&self.statements),
            _release: Release::open(&self.counter),
        }))
    }
}

struct FakeRelationalSession {
    rows: Vec<RelationalRow>,
    rows_affected: u64,
    query_error: Option<String>,
    statements: Arc<Mutex<Vec<Statement>>>,
    _release: Release,
}

impl FakeRelationalSession {
    fn record(&self, sql: &str, params: &[&str]) {
        self.statements
            .lock()
            .expect("statement log poisoned")
            .push(Statement {
                sql: sql.to_string(),
                params: params.iter().map(|p| p.to_string()).collect(),
            });
    }
}

#[async_trait]
impl RelationalSession for FakeRelationalSession {
    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<RelationalRow>> {
        self.record(sql, params);
        match &self.query_error {
            Some(message) => Err(ServiceError::Backend(message.clone())),
            None => Ok(self.rows.clone()),
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.record(sql, &[]);
        match &self.query_error {
            Some(message) => Err(ServiceError::Backend(message.clone())),
            None => Ok(self.rows_affected),
        }
    }
}

pub fn table(records: Vec<Value>) -> FluxTable {
    FluxTable {
        records: records.into_iter().map(FluxRecord::from_json).collect(),
    }
}

pub fn reading(equipment: &str, metric: &str, time: &str, value: f64) -> Value {
    json!({
        "_time": time,
        "_value": value,
        "_field": "measurement",
        "_measurement": "sensor_data",
        "equipment_name": equipment,
        "metric": metric,
    })
}

/// Dispatcher plus router over shared fake backends.
pub struct ToolHarness {
    pub influx: Arc<FakeTimeSeries>,
    pub postgres: Arc<FakeRelational>,
    pub dispatcher: ToolDispatcher,
    router: Router,
}

impl ToolHarness {
    pub fn new(influx: FakeTimeSeries, postgres: FakeRelational) -> Self {
        init_tracing();
        let influx = Arc::new(influx);
        let postgres = Arc::new(postgres);
        let config = Arc::new(test_config());
        let dispatcher = ToolDispatcher::new(
            Arc::clone(&config),
            influx.clone() as Arc<dyn TimeSeriesSource>,
            postgres.clone() as Arc<dyn RelationalSource>,
        );
        let server = Server::with_backends(
            test_config(),
            influx.clone() as Arc<dyn TimeSeriesSource>,
            postgres.clone() as Arc<dyn RelationalSource>,
        );

        Self {
            influx,
            postgres,
            dispatcher,
            router: server.router(),
        }
    }

    pub fn influx(influx: FakeTimeSeries) -> Self {
        Self::new(influx, FakeRelational::default())
    }

    pub fn postgres(postgres: FakeRelational) -> Self {
        Self::new(FakeTimeSeries::default(), postgres)
    }

    /// Calls a tool through the dispatcher and returns the parsed payload.
    pub async fn call(&self, name: &str, arguments: Value) -> Value {
        self.dispatcher.call(name, arguments).await.payload()
    }

    pub async fn post_call(&self, body: Value) -> http::Response<Body> {
        let request = Request::builder()
            .method(http::Method::POST)
            .uri("/api/tools/call")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("failed to build tool call request");
        self.send(request).await
    }

    pub async fn get(&self, uri: &str) -> http::Response<Body> {
        let request = Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("failed to build GET request");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> http::Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    let value = serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Extracts the JSON payload carried in a tool response's text block.
pub fn tool_payload(body: &Value) -> Value {
    let text = body["content"][0]["text"]
        .as_str()
        .expect("tool response should carry one text block");
    serde_json::from_str(text).expect("text block should hold JSON")
}
