//! HTTP API
//!
//! Routes:
//! - `POST /load?url=…` or `POST /load?name=…` with the CSV as body
//! - `GET /api/memory/:id` queries a table wherever it lives
//! - `GET /api/:id` redirects to the memory route until the table is persisted
//! - `POST /api/:id/persist` promotes a table to the durable store

use crate::error::ApiError;
use crate::query::QuerySpec;
use crate::service::TableService;
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Path, RawQuery, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<TableService>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub timestamp: String,
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadResponse {
    pub ok: bool,
    pub id: String,
    pub endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistResponse {
    pub ok: bool,
    pub message: String,
    pub persisted: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Page of rows in one of the two output shapes.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Rows {
    Objects(Vec<Map<String, Value>>),
    Array(Vec<Vec<Value>>),
}

#[derive(Debug, Serialize)]
pub struct DataResponse {
    pub ok: bool,
    pub query_ms: f64,
    pub columns: Vec<String>,
    /// Rows in this page, not in the table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    pub rows: Rows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Objects,
    Array,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoadParams {
    pub url: Option<String>,
    pub name: Option<String>,
}

/// Raw table query parameters. Numbers are parsed leniently: anything that
/// is not an integer counts as 0.
#[derive(Debug, Default, Deserialize)]
pub struct TableQueryParams {
    #[serde(rename = "_size")]
    pub size: Option<String>,
    #[serde(rename = "_offset")]
    pub offset: Option<String>,
    #[serde(rename = "_sort")]
    pub sort: Option<String>,
    #[serde(rename = "_sort_desc")]
    pub sort_desc: Option<String>,
    #[serde(rename = "_shape")]
    pub shape: Option<String>,
    #[serde(rename = "_rowid")]
    pub rowid: Option<String>,
    #[serde(rename = "_total")]
    pub total: Option<String>,
}

/// Query string extractor that keeps the first value of a repeated key and
/// answers malformed input with the JSON error envelope.
pub struct FirstValueQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for FirstValueQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parse_first_values(parts.uri.query().unwrap_or_default()).map(FirstValueQuery)
    }
}

pub fn parse_first_values<T: DeserializeOwned>(query: &str) -> Result<T, ApiError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
        .map_err(|e| ApiError::BadRequest(format!("Invalid query string: {}", e)))?;

    let mut fields = Map::new();
    for (key, value) in pairs {
        fields.entry(key).or_insert(Value::String(value));
    }
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| ApiError::BadRequest(format!("Invalid query parameters: {}", e)))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn lenient_int(value: &Option<String>) -> i64 {
    value
        .as_deref()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

impl TableQueryParams {
    pub fn to_spec(&self) -> QuerySpec {
        // `_sort_desc=col` both names the column and flips the direction
        let sort_column = non_empty(&self.sort)
            .or_else(|| non_empty(&self.sort_desc))
            .map(str::to_string);

        QuerySpec {
            limit: lenient_int(&self.size),
            offset: lenient_int(&self.offset),
            sort_column,
            sort_descending: non_empty(&self.sort_desc).is_some(),
            include_row_number: self.rowid.as_deref() != Some("hide"),
        }
    }

    pub fn shape(&self) -> Shape {
        match non_empty(&self.shape) {
            None | Some("objects") => Shape::Objects,
            Some(_) => Shape::Array,
        }
    }

    pub fn show_total(&self) -> bool {
        self.total.as_deref() != Some("hide")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) | ApiError::Fetch(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyPersisted(_) => StatusCode::CONFLICT,
            ApiError::Import(_)
            | ApiError::Query(_)
            | ApiError::Persistence(_)
            | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("{}", self);
        } else {
            debug!("{}", self);
        }

        let body = ErrorResponse {
            timestamp: Utc::now().to_rfc3339(),
            error: self.category().to_string(),
            message: self.detail().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_router(service: Arc<TableService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/load", post(load_csv))
        .route("/api/memory/:id", get(query_memory))
        .route("/api/:id", get(query_table))
        .route("/api/:id/persist", post(persist_table))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(ApiState { service })
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}", host)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn load_csv(
    State(state): State<ApiState>,
    FirstValueQuery(params): FirstValueQuery<LoadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<LoadResponse>, ApiError> {
    let record = match (non_empty(&params.url), non_empty(&params.name)) {
        (Some(url), None) => state.service.import_url(url).await?,
        (None, Some(name)) => {
            state
                .service
                .import_stream(name, body.into_data_stream())
                .await?
        }
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "Provide either 'url' or 'name', not both".to_string(),
            ))
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "Either 'url' or 'name' parameter must be provided".to_string(),
            ))
        }
    };

    Ok(Json(LoadResponse {
        ok: true,
        endpoint: format!("{}/api/memory/{}", base_url(&headers), record.id),
        id: record.id,
    }))
}

async fn respond_with_rows(
    state: &ApiState,
    id: &str,
    params: &TableQueryParams,
) -> Result<Response, ApiError> {
    let (_, output) = state.service.query(id, &params.to_spec()).await?;

    let rows = match params.shape() {
        Shape::Objects => Rows::Objects(output.named_rows),
        Shape::Array => Rows::Array(output.tuple_rows),
    };
    let response = DataResponse {
        ok: true,
        query_ms: output.elapsed_ms,
        columns: output.columns,
        total: params.show_total().then_some(output.row_count),
        rows,
    };
    Ok(Json(response).into_response())
}

async fn query_memory(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    FirstValueQuery(params): FirstValueQuery<TableQueryParams>,
) -> Result<Response, ApiError> {
    respond_with_rows(&state, &id, &params).await
}

async fn query_table(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    RawQuery(raw_query): RawQuery,
    FirstValueQuery(params): FirstValueQuery<TableQueryParams>,
) -> Result<Response, ApiError> {
    let record = state.service.record(&id).await?;
    if !record.persisted {
        let query = raw_query.map(|q| format!("?{}", q)).unwrap_or_default();
        return Ok(Redirect::temporary(&format!("/api/memory/{}{}", id, query)).into_response());
    }
    respond_with_rows(&state, &id, &params).await
}

async fn persist_table(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PersistResponse>, ApiError> {
    let message = match state.service.promote(&id).await {
        Ok(_) => format!(
            "Successfully persisted. You can now query at {}/api/{}",
            base_url(&headers),
            id
        ),
        Err(ApiError::AlreadyPersisted(_)) => "Table already persisted".to_string(),
        Err(e) => return Err(e),
    };

    Ok(Json(PersistResponse {
        ok: true,
        message,
        persisted: true,
    }))
}
