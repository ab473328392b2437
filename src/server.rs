use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::construct::{ColumnDef, ColumnId, ColumnSpec, Database, Record, RecordId, Registry, RegistryId};
use crate::error::{Kind, RegistrarError, Violation};
use crate::{export, search};

/// Header an upstream auth proxy uses to say who is calling.
pub const OWNER_HEADER: &str = "x-registrar-user";

pub struct AppState {
    pub database: Arc<Database>,
    pub default_owner: String,
}

impl AppState {
    fn owner(&self, headers: &HeaderMap) -> String {
        headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.default_owner.clone())
    }
}

// ------------- Errors -------------
pub struct ApiError(RegistrarError);

impl From<RegistrarError> for ApiError {
    fn from(e: RegistrarError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            RegistrarError::Validation { violations } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "validation failed", "violations": violations }),
            ),
            RegistrarError::NotFound { .. } => (StatusCode::NOT_FOUND, json!({ "error": self.0.to_string() })),
            other => {
                // internal details stay in the log
                error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "internal error" }))
            }
        };
        if status.is_client_error() {
            warn!(code = %status.as_u16(), error = %self.0, "request refused");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// Unparseable ids cannot name anything, so they are simply unknown.
fn parse_id<T: FromStr>(kind: Kind, text: &str) -> ApiResult<T> {
    text.parse::<T>()
        .map_err(|_| ApiError(RegistrarError::not_found(kind, text)))
}

// The engine is synchronous, so calls run on the blocking pool.
async fn blocking<T, F>(state: &AppState, work: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> crate::error::Result<T> + Send + 'static,
{
    let database = Arc::clone(&state.database);
    tokio::task::spawn_blocking(move || work(&database))
        .await
        .map_err(|e| {
            warn!(error = %e, "Join error");
            ApiError(RegistrarError::Invariant(format!("join error: {e}")))
        })?
        .map_err(ApiError)
}

// ------------- Bodies -------------
#[derive(Deserialize)]
pub struct CreateRegistry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

#[derive(Deserialize)]
pub struct UpdateRegistry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<ColumnSpec>>,
}

#[derive(Deserialize)]
pub struct RecordBody {
    #[serde(default)]
    pub data: Map<String, JsonValue>,
}

#[derive(Deserialize)]
pub struct RenameColumn {
    pub name: String,
}

#[derive(Deserialize)]
pub struct OptionsBody {
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Deserialize)]
pub struct OrderBody {
    pub order: Vec<String>,
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: Option<String>,
}

// ------------- Registries -------------
async fn create_registry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRegistry>,
) -> ApiResult<(StatusCode, Json<Registry>)> {
    let owner = state.owner(&headers);
    let registry = blocking(&state, move |db| {
        db.create_registry(&body.name, body.description.as_deref(), body.columns, &owner)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(registry)))
}

async fn list_registries(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Registry>>> {
    Ok(Json(blocking(&state, |db| db.registries()).await?))
}

async fn get_registry(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<Registry>> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    Ok(Json(blocking(&state, move |db| db.registry(id)).await?))
}

async fn update_registry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRegistry>,
) -> ApiResult<Json<Registry>> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let registry = blocking(&state, move |db| {
        db.update_registry(id, body.name.as_deref(), body.description.as_deref(), body.columns)
    })
    .await?;
    Ok(Json(registry))
}

async fn delete_registry(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    // deletes are idempotent, an id that names nothing is already gone
    if let Ok(id) = id.parse::<RegistryId>() {
        blocking(&state, move |db| db.delete_registry(id)).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ------------- Columns -------------
async fn add_column(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(spec): Json<ColumnSpec>,
) -> ApiResult<(StatusCode, Json<ColumnDef>)> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let column = blocking(&state, move |db| db.add_column(id, spec)).await?;
    Ok((StatusCode::CREATED, Json(column)))
}

async fn rename_column(
    State(state): State<Arc<AppState>>,
    Path((id, column)): Path<(String, String)>,
    Json(body): Json<RenameColumn>,
) -> ApiResult<Json<ColumnDef>> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let column: ColumnId = parse_id(Kind::Column, &column)?;
    Ok(Json(blocking(&state, move |db| db.rename_column(id, column, &body.name)).await?))
}

async fn remove_column(
    State(state): State<Arc<AppState>>,
    Path((id, column)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let column: ColumnId = parse_id(Kind::Column, &column)?;
    blocking(&state, move |db| db.remove_column(id, column)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_options(
    State(state): State<Arc<AppState>>,
    Path((id, column)): Path<(String, String)>,
    Json(body): Json<OptionsBody>,
) -> ApiResult<Json<ColumnDef>> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let column: ColumnId = parse_id(Kind::Column, &column)?;
    Ok(Json(blocking(&state, move |db| db.update_options(id, column, body.options)).await?))
}

async fn reorder_columns(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<OrderBody>,
) -> ApiResult<Json<Registry>> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let mut order = Vec::with_capacity(body.order.len());
    let mut violations = Vec::new();
    for entry in &body.order {
        match entry.parse::<ColumnId>() {
            Ok(column) => order.push(column),
            Err(_) => violations.push(Violation::field(entry.as_str(), "unknown column")),
        }
    }
    if !violations.is_empty() {
        return Err(ApiError(RegistrarError::invalid(violations)));
    }
    Ok(Json(blocking(&state, move |db| db.reorder_columns(id, &order)).await?))
}

// ------------- Records -------------
async fn create_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RecordBody>,
) -> ApiResult<(StatusCode, Json<Record>)> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let record = blocking(&state, move |db| db.create_record(id, &body.data)).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<Record>>> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let query = params.q.unwrap_or_default();
    Ok(Json(blocking(&state, move |db| search::search(db, id, &query)).await?))
}

// A record addressed through the wrong registry does not exist there.
fn record_of(db: &Database, registry: RegistryId, record: RecordId) -> crate::error::Result<Record> {
    let found = db.record(record)?;
    if found.registry_id != registry {
        return Err(RegistrarError::not_found(Kind::Record, record));
    }
    Ok(found)
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Path((id, record)): Path<(String, String)>,
) -> ApiResult<Json<Record>> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let record: RecordId = parse_id(Kind::Record, &record)?;
    Ok(Json(blocking(&state, move |db| record_of(db, id, record)).await?))
}

async fn update_record(
    State(state): State<Arc<AppState>>,
    Path((id, record)): Path<(String, String)>,
    Json(body): Json<RecordBody>,
) -> ApiResult<Json<Record>> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let record: RecordId = parse_id(Kind::Record, &record)?;
    let updated = blocking(&state, move |db| {
        record_of(db, id, record)?;
        db.update_record(record, &body.data)
    })
    .await?;
    Ok(Json(updated))
}

async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path((id, record)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if let (Ok(id), Ok(record)) = (id.parse::<RegistryId>(), record.parse::<RecordId>()) {
        blocking(&state, move |db| match record_of(db, id, record) {
            Ok(_) => db.delete_record(record),
            Err(RegistrarError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        })
        .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ------------- Export -------------
// RFC 5987 value for non-ASCII file names.
fn encode_file_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' | b'~' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn content_disposition(file_name: &str) -> HeaderValue {
    let fallback: String = file_name
        .chars()
        .map(|c| if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' { c } else { '_' })
        .collect();
    let value = format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        encode_file_name(file_name)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn export_registry(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Response> {
    let id: RegistryId = parse_id(Kind::Registry, &id)?;
    let export = blocking(&state, move |db| export::export_csv(db, id)).await?;
    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8")),
        (header::CONTENT_DISPOSITION, content_disposition(&export.file_name)),
    ];
    Ok((StatusCode::OK, headers, export.bytes).into_response())
}

pub fn router(database: Arc<Database>, default_owner: String) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let state = Arc::new(AppState {
        database,
        default_owner,
    });
    info!("routes ready");
    Router::new()
        .route("/registries", post(create_registry).get(list_registries))
        .route(
            "/registries/:id",
            get(get_registry).put(update_registry).delete(delete_registry),
        )
        .route("/registries/:id/columns", post(add_column))
        .route("/registries/:id/order", put(reorder_columns))
        .route(
            "/registries/:id/columns/:column",
            patch(rename_column).delete(remove_column),
        )
        .route("/registries/:id/columns/:column/options", put(update_options))
        .route("/registries/:id/records", post(create_record).get(list_records))
        .route(
            "/registries/:id/records/:record",
            get(get_record).put(update_record).delete(delete_record),
        )
        .route("/registries/:id/export", get(export_registry))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
