use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use factory_tools::{
    backend::TimeSeriesSource,
    config::InfluxConfig,
    error::ServiceError,
    influx::{records, InfluxSource},
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::TcpListener;

const CSV_BODY: &str = "\
#datatype,string,long,dateTime:RFC3339,double,string,string
#group,false,false,false,false,true,true
#default,_result,,,,,
,result,table,_time,_value,equipment_name,metric
,,0,2025-03-01T10:00:00Z,81.5,Polymerization Reactor,Temperature
,,1,2025-03-01T10:00:05Z,2.25,Polymerization Reactor,Pressure
";

#[derive(Debug, Default)]
struct Captured {
    authorization: Option<String>,
    accept: Option<String>,
    org: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct StubState {
    captured: Arc<Mutex<Captured>>,
    fail: bool,
}

async fn query_endpoint(
    State(state): State<StubState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    {
        let mut captured = state.captured.lock().expect("capture lock poisoned");
        captured.authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured.accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured.org = params.get("org").cloned();
        captured.body = body;
    }

    if state.fail {
        return (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"code": "invalid", "message": "compilation failed: undefined identifier"})
                .to_string(),
        );
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv")],
        CSV_BODY.to_string(),
    )
}

async fn spawn_stub(fail: bool) -> (String, Arc<Mutex<Captured>>) {
    let captured = Arc::new(Mutex::new(Captured::default()));
    let app = Router::new()
        .route("/api/v2/query", post(query_endpoint))
        .with_state(StubState {
            captured: Arc::clone(&captured),
            fail,
        });
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("stub listener should bind");
    let addr = listener.local_addr().expect("stub address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), captured)
}

fn source(url: String) -> InfluxSource {
    InfluxSource::new(
        InfluxConfig {
            url,
            token: "secret-token".to_string(),
            org: "plant".to_string(),
            bucket: "44".to_string(),
        },
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn query_posts_flux_and_decodes_tables() {
    let (url, captured) = spawn_stub(false).await;
    let source = source(url);

    let mut session = source.connect().await.expect("session should open");
    let tables = session
        .query("from(bucket: \"44\")\n  |> range(start: -1h)")
        .await
        .expect("query should succeed");

    assert_eq!(tables.len(), 2);
    let values: Vec<(Option<String>, Option<f64>)> = records(&tables)
        .map(|r| (r.get_string("metric"), r.get_f64("_value")))
        .collect();
    assert_eq!(
        values,
        vec![
            (Some("Temperature".to_string()), Some(81.5)),
            (Some("Pressure".to_string()), Some(2.25)),
        ]
    );

    let captured = captured.lock().expect("capture lock poisoned");
    assert_eq!(captured.authorization.as_deref(), Some("Token secret-token"));
    assert_eq!(captured.accept.as_deref(), Some("application/csv"));
    assert_eq!(captured.org.as_deref(), Some("plant"));
    assert_eq!(captured.body["type"], json!("flux"));
    assert_eq!(
        captured.body["query"],
        json!("from(bucket: \"44\")\n  |> range(start: -1h)")
    );
    assert_eq!(
        captured.body["dialect"]["annotations"],
        json!(["datatype", "group", "default"])
    );
}

#[tokio::test]
async fn error_status_carries_server_message() {
    let (url, _captured) = spawn_stub(true).await;
    let source = source(url);

    let mut session = source.connect().await.expect("session should open");
    let err = session
        .query("from(bucket: \"44\") |> nope()")
        .await
        .expect_err("query should fail");

    assert!(matches!(err, ServiceError::Backend(_)));
    assert!(err
        .to_string()
        .contains("invalid: compilation failed: undefined identifier"));
}

#[tokio::test]
async fn refused_connection_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("probe listener should bind");
    let addr = listener.local_addr().expect("probe address");
    drop(listener);

    let source = source(format!("http://{addr}"));
    let mut session = source.connect().await.expect("session should open");
    let err = session
        .query("from(bucket: \"44\")")
        .await
        .expect_err("nothing is listening");

    assert!(matches!(err, ServiceError::Connection(_)), "{err:?}");
}
