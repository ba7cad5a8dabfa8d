//! REST API routes for registry records, geometries, attachments,
//! spreadsheet exchange and registry configuration.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use base64::Engine;
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, ApiResult, Caller};
use crate::database::audit_log::AuditEntry;
use crate::database::{FileInfo, TurningPoint};
use crate::engine::RegistryEngine;
use crate::error::RegistryError;
use crate::import_export::{ExportFile, ImportReport};
use crate::registry::admin::{RegistryConfig, RegistryCreated};
use crate::registry::crud::{ItemPage, ItemPayload, ItemView, RegistryClaims, SavedItem, UploadedFile};
use crate::registry::descriptor::RegistryDescriptor;
use crate::registry::query::ListRequest;
use crate::registry::value::Record;
use crate::spatial::{GeometryInput, GeometryOutcome};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    pub content_base64: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRequest {
    #[serde(flatten)]
    pub payload: ItemPayload,
    #[serde(default)]
    pub uploads: Vec<UploadRequest>,
    /// Projection of attached contour files; contours are ignored without it.
    #[serde(default)]
    pub projection: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryRequest {
    pub geometry: GeometryInput,
    #[serde(default)]
    pub projection: Option<i32>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprojectRequest {
    pub geometry: GeometryInput,
    pub from_srid: i32,
    pub to_srid: i32,
}

#[derive(Debug, Deserialize)]
pub struct ReferenceQuery {
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GisIdRequest {
    pub gis_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JournalQuery {
    pub limit: Option<i64>,
}

fn decode_uploads(uploads: &[UploadRequest]) -> ApiResult<Vec<UploadedFile>> {
    uploads
        .iter()
        .map(|u| {
            let content = base64::engine::general_purpose::STANDARD
                .decode(&u.content_base64)
                .map_err(|_| RegistryError::invalid_value(&u.file_name, "file content must be base64 encoded"))?;
            Ok(UploadedFile {
                file_name: u.file_name.clone(),
                content,
            })
        })
        .collect()
}

fn file_response(content_type: &str, file_name: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}\"")),
        ],
        bytes,
    )
        .into_response()
}

fn export_response(file: ExportFile) -> Response {
    file_response(file.content_type, &file.file_name, file.bytes)
}

fn not_found(what: String) -> ApiError {
    ApiError(RegistryError::NotFound(what))
}

// ============================================================================
// Record Handlers
// ============================================================================

/// POST /api/registries/:registry_id/items/query
async fn list_items(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
    Json(request): Json<ListRequest>,
) -> ApiResult<Json<ItemPage>> {
    Ok(Json(engine.crud.paginate(&actor, registry_id, &request).await?))
}

/// POST /api/registries/:registry_id/items
async fn create_item(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
    Json(request): Json<ItemRequest>,
) -> ApiResult<(StatusCode, Json<SavedItem>)> {
    let uploads = decode_uploads(&request.uploads)?;
    let saved = engine
        .crud
        .create_item(&actor, registry_id, &request.payload, &uploads, request.projection)
        .await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// GET /api/registries/:registry_id/items/:record_id
async fn get_item(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<ItemView>> {
    Ok(Json(engine.crud.get_item(&actor, registry_id, &record_id).await?))
}

/// PUT /api/registries/:registry_id/items/:record_id
async fn edit_item(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
    Json(request): Json<ItemRequest>,
) -> ApiResult<Json<SavedItem>> {
    let uploads = decode_uploads(&request.uploads)?;
    let saved = engine
        .crud
        .edit_item(&actor, registry_id, &record_id, &request.payload, &uploads, request.projection)
        .await?;
    Ok(Json(saved))
}

/// DELETE /api/registries/:registry_id/items/:record_id
async fn delete_item(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
) -> ApiResult<StatusCode> {
    engine.crud.delete_item(&actor, registry_id, &record_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/registries/:registry_id/by-gis-id/:gis_id
async fn get_by_gis_id(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, gis_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<Record>> {
    engine
        .crud
        .get_by_gis_id(&actor, registry_id, &gis_id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("record bound to geometry {gis_id}")))
}

/// GET /api/registries
async fn list_registries(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
) -> ApiResult<Json<Vec<RegistryDescriptor>>> {
    let registries = engine.crud.readable_registries(&actor).await?;
    Ok(Json(registries.iter().map(|d| d.as_ref().clone()).collect()))
}

/// GET /api/registries/:registry_id/claims
async fn get_claims(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
) -> ApiResult<Json<RegistryClaims>> {
    let (_, claims) = engine.crud.registry_claims(&actor, registry_id).await?;
    Ok(Json(claims))
}

/// GET /api/registries/:registry_id/journal
async fn get_journal(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
    Query(query): Query<JournalQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let (descriptor, claims) = engine.crud.registry_claims(&actor, registry_id).await?;
    if !claims.read {
        return Err(ApiError(RegistryError::CapabilityDenied {
            resource: descriptor.name.clone(),
            action: "read".to_string(),
        }));
    }
    let entries = engine
        .audit
        .entries_for_target(&descriptor.name, query.limit.unwrap_or(100).clamp(1, 1000))
        .await?;
    Ok(Json(entries))
}

// ============================================================================
// Attachment and Turning Point Handlers
// ============================================================================

/// GET /api/registries/:registry_id/items/:record_id/files
async fn list_files(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<Vec<FileInfo>>> {
    Ok(Json(engine.crud.list_files(&actor, registry_id, &record_id).await?))
}

/// GET /api/registries/:registry_id/items/:record_id/files/:file_id
async fn download_file(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id, file_id)): Path<(Uuid, String, Uuid)>,
) -> ApiResult<Response> {
    let (info, bytes) = engine.crud.read_file(&actor, registry_id, &record_id, file_id).await?;
    Ok(file_response("application/octet-stream", &info.file_name(), bytes))
}

/// DELETE /api/registries/:registry_id/items/:record_id/files/:file_id
async fn delete_file(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id, file_id)): Path<(Uuid, String, Uuid)>,
) -> ApiResult<StatusCode> {
    engine.crud.delete_file(&actor, registry_id, &record_id, file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/registries/:registry_id/items/:record_id/turning-points
async fn list_turning_points(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<Vec<TurningPoint>>> {
    Ok(Json(engine.crud.list_turning_points(&actor, registry_id, &record_id).await?))
}

// ============================================================================
// Geometry Handlers
// ============================================================================

/// GET /api/registries/:registry_id/items/:record_id/geometry
async fn get_geometry(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
) -> ApiResult<Response> {
    let geojson = engine
        .geometry
        .get_geometry(&actor, registry_id, &record_id)
        .await?
        .ok_or_else(|| not_found(format!("geometry of record {record_id}")))?;
    Ok(([(header::CONTENT_TYPE, "application/geo+json")], geojson).into_response())
}

/// POST /api/registries/:registry_id/items/:record_id/geometry
async fn create_geometry(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
    Json(request): Json<GeometryRequest>,
) -> ApiResult<Json<GeometryOutcome>> {
    let outcome = engine
        .geometry
        .create_geometry(&actor, registry_id, &record_id, &request.geometry, request.projection)
        .await?;
    Ok(Json(outcome))
}

/// PUT /api/registries/:registry_id/items/:record_id/geometry
async fn update_geometry(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
    Json(request): Json<GeometryRequest>,
) -> ApiResult<Json<GeometryOutcome>> {
    let outcome = engine
        .geometry
        .update_geometry(
            &actor,
            registry_id,
            &record_id,
            request.reference.as_deref(),
            &request.geometry,
            request.projection,
        )
        .await?;
    Ok(Json(outcome))
}

/// DELETE /api/registries/:registry_id/items/:record_id/geometry
async fn delete_geometry(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
    Query(query): Query<ReferenceQuery>,
) -> ApiResult<Json<GeometryOutcome>> {
    let outcome = engine
        .geometry
        .delete_geometry(&actor, registry_id, &record_id, query.reference.as_deref())
        .await?;
    Ok(Json(outcome))
}

/// PUT /api/registries/:registry_id/items/:record_id/gis-id
async fn change_gis_id(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, record_id)): Path<(Uuid, String)>,
    Json(request): Json<GisIdRequest>,
) -> ApiResult<StatusCode> {
    engine
        .geometry
        .change_gis_id(&actor, registry_id, &record_id, request.gis_id.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/registries/:registry_id/geometries/:reference/count
async fn count_geometries(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path((registry_id, reference)): Path<(Uuid, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let count = engine.geometry.count_geometries(&actor, registry_id, &reference).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// POST /api/geometry/reproject
async fn reproject_geometry(
    State(engine): State<RegistryEngine>,
    Json(request): Json<ReprojectRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let wkt = engine
        .geometry
        .reproject(&request.geometry, request.from_srid, request.to_srid)
        .await?;
    Ok(Json(serde_json::json!({ "wkt": wkt })))
}

// ============================================================================
// Spreadsheet Handlers
// ============================================================================

/// POST /api/registries/:registry_id/import
async fn import_items(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<ImportReport>> {
    Ok(Json(engine.import.import(&actor, registry_id, &body).await?))
}

/// GET /api/import-logs/:token
async fn import_log(State(engine): State<RegistryEngine>, Path(token): Path<Uuid>) -> ApiResult<Response> {
    Ok(export_response(engine.export.error_log(token).await?))
}

/// POST /api/registries/:registry_id/export
async fn export_items(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
    Json(request): Json<ListRequest>,
) -> ApiResult<Response> {
    Ok(export_response(engine.export.export(&actor, registry_id, &request).await?))
}

/// GET /api/registries/:registry_id/template
async fn import_template(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(export_response(engine.export.template(&actor, registry_id).await?))
}

// ============================================================================
// Configuration Handlers
// ============================================================================

/// POST /api/registries
async fn create_registry(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Json(config): Json<RegistryConfig>,
) -> ApiResult<(StatusCode, Json<RegistryCreated>)> {
    let created = engine.admin.create_registry(&actor, &config).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /api/registries/:registry_id
async fn update_registry(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
    Json(config): Json<RegistryConfig>,
) -> ApiResult<StatusCode> {
    engine.admin.update_registry(&actor, registry_id, &config).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/registries/:registry_id
async fn delete_registry(
    State(engine): State<RegistryEngine>,
    Caller(actor): Caller,
    Path(registry_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    engine.admin.delete_registry(&actor, registry_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/health
async fn health_check(State(engine): State<RegistryEngine>) -> Json<serde_json::Value> {
    let database = sqlx::query("SELECT 1").execute(&engine.pool).await.is_ok();
    Json(serde_json::json!({
        "status": if database { "healthy" } else { "degraded" },
        "service": "gis-registry",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============================================================================
// Router Factory
// ============================================================================

pub fn create_registry_router(engine: RegistryEngine) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/registries", get(list_registries).post(create_registry))
        .route("/api/registries/:registry_id", put(update_registry).delete(delete_registry))
        .route("/api/registries/:registry_id/claims", get(get_claims))
        .route("/api/registries/:registry_id/journal", get(get_journal))
        .route("/api/registries/:registry_id/items", post(create_item))
        .route("/api/registries/:registry_id/items/query", post(list_items))
        .route(
            "/api/registries/:registry_id/items/:record_id",
            get(get_item).put(edit_item).delete(delete_item),
        )
        .route("/api/registries/:registry_id/by-gis-id/:gis_id", get(get_by_gis_id))
        .route("/api/registries/:registry_id/items/:record_id/files", get(list_files))
        .route(
            "/api/registries/:registry_id/items/:record_id/files/:file_id",
            get(download_file).delete(delete_file),
        )
        .route(
            "/api/registries/:registry_id/items/:record_id/turning-points",
            get(list_turning_points),
        )
        .route(
            "/api/registries/:registry_id/items/:record_id/geometry",
            get(get_geometry)
                .post(create_geometry)
                .put(update_geometry)
                .delete(delete_geometry),
        )
        .route("/api/registries/:registry_id/items/:record_id/gis-id", put(change_gis_id))
        .route(
            "/api/registries/:registry_id/geometries/:reference/count",
            get(count_geometries),
        )
        .route("/api/registries/:registry_id/import", post(import_items))
        .route("/api/registries/:registry_id/export", post(export_items))
        .route("/api/registries/:registry_id/template", get(import_template))
        .route("/api/import-logs/:token", get(import_log))
        .route("/api/geometry/reproject", post(reproject_geometry))
        .with_state(engine)
}
