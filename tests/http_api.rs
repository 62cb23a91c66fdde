use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use csv_api::ephemeral::EnginePool;
use csv_api::{api, durable, TableService};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const SAMPLE: &str = "a,b,c\n1,2,3\n4,5,6\n7,8,9\n";

async fn create_test_app() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let store = durable::connect(":memory:").await.unwrap();
    let pool = Arc::new(EnginePool::new(dir.path()).unwrap());
    let service = Arc::new(TableService::new(store, pool));
    (dir, api::create_router(service))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::HOST, "csv.test")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn load_sample(app: &Router) -> String {
    let (status, _, body) = send(app, post("/load?name=sample.csv", SAMPLE)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let (_dir, app) = create_test_app().await;
    let (status, _, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
}

#[tokio::test]
async fn test_load_returns_memory_endpoint() {
    let (_dir, app) = create_test_app().await;
    let (status, _, body) = send(&app, post("/load?name=sample.csv", SAMPLE)).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap();
    assert_eq!(
        body["endpoint"],
        json!(format!("http://csv.test/api/memory/{}", id))
    );
}

#[tokio::test]
async fn test_load_parameter_errors() {
    let (_dir, app) = create_test_app().await;

    let (status, _, body) = send(&app, post("/load", SAMPLE)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Bad request"));
    assert!(body["timestamp"].is_string());

    let (status, _, _) = send(&app, post("/load?name=a.csv&url=http://x/a.csv", SAMPLE)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(&app, post("/load?url=ftp://example.com/a.csv", "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Bad request"));
}

#[tokio::test]
async fn test_memory_query_shapes() {
    let (_dir, app) = create_test_app().await;
    let id = load_sample(&app).await;

    let (status, _, body) = send(&app, get(&format!("/api/memory/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["columns"], json!(["rowid", "a", "b", "c"]));
    assert_eq!(body["total"], json!(3));
    assert_eq!(body["rows"][0], json!({"rowid": 1, "a": 1, "b": 2, "c": 3}));

    let uri = format!(
        "/api/memory/{}?_shape=array&_rowid=hide&_total=hide&_size=1&_offset=1",
        id
    );
    let (status, _, body) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("total").is_none());
    assert_eq!(body["columns"], json!(["a", "b", "c"]));
    assert_eq!(body["rows"], json!([[4, 5, 6]]));
}

#[tokio::test]
async fn test_total_is_page_size() {
    let (_dir, app) = create_test_app().await;
    let id = load_sample(&app).await;

    let (status, _, body) = send(&app, get(&format!("/api/memory/{}?_size=1", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(1));
    assert_eq!(body["rows"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_parameters_keep_first_value() {
    let (_dir, app) = create_test_app().await;

    let (status, _, body) = send(&app, post("/load?name=a.csv&name=b.csv", SAMPLE)).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, _, body) = send(&app, get(&format!("/api/memory/{}?_size=1&_size=2", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(1));
}

#[tokio::test]
async fn test_unknown_table_is_404() {
    let (_dir, app) = create_test_app().await;
    let (status, _, body) = send(&app, get("/api/memory/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("Resource not found"));

    let (status, _, _) = send(&app, get("/api/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_sort_column_is_500() {
    let (_dir, app) = create_test_app().await;
    let id = load_sample(&app).await;
    let (status, _, body) = send(&app, get(&format!("/api/memory/{}?_sort=nope", id))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], json!("Query error"));
}

#[tokio::test]
async fn test_table_route_redirects_until_persisted() {
    let (_dir, app) = create_test_app().await;
    let id = load_sample(&app).await;

    let (status, headers, _) = send(&app, get(&format!("/api/{}?_size=2", id))).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        headers[header::LOCATION],
        format!("/api/memory/{}?_size=2", id).as_str()
    );

    let (status, _, body) = send(&app, post(&format!("/api/{}/persist", id), "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["persisted"], json!(true));
    assert_eq!(
        body["message"],
        json!(format!(
            "Successfully persisted. You can now query at http://csv.test/api/{}",
            id
        ))
    );

    let (status, _, body) = send(&app, get(&format!("/api/{}?_rowid=hide", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rows"][0], json!({"a": "1", "b": "2", "c": "3"}));

    // the memory route follows the table after promotion
    let (status, _, body) = send(&app, get(&format!("/api/memory/{}?_rowid=hide", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rows"][2], json!({"a": "7", "b": "8", "c": "9"}));

    let (status, _, body) = send(&app, post(&format!("/api/{}/persist", id), "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], json!("Table already persisted"));
}

#[tokio::test]
async fn test_persist_unknown_table() {
    let (_dir, app) = create_test_app().await;
    let (status, _, _) = send(&app, post("/api/missing/persist", "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
