use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use bytes::Bytes;

use dsapi_engine::metadata::DatasetMetadata;
use dsapi_engine::service::{
    CreateDatasetRequest, CreatedDataset, PromoteDatasetRequest, ShownDataset, UpdateDatasetRequest,
};
use dsapi_engine::RequestContext;

use super::{decode, ApiError, DatasetPath, DsApi, GroupPath};

pub(crate) async fn list_handler(Path(_path): Path<GroupPath>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({
            "error": "NotImplemented",
            "message": "listing datasets is not supported",
        })),
    )
}

pub(crate) async fn create_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<GroupPath>,
    body: Bytes,
) -> Result<Json<CreatedDataset>, ApiError> {
    let service = api.tenant(&path.account)?;
    let req: CreateDatasetRequest = decode(&body)?;
    let created = service.create_dataset(&ctx, &path.group, req).await?;
    api.metrics.datasets_created.inc();
    Ok(Json(created))
}

pub(crate) async fn show_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
) -> Result<Json<ShownDataset>, ApiError> {
    let service = api.tenant(&path.account)?;
    Ok(Json(service.show_dataset(&ctx, &path.id).await?))
}

pub(crate) async fn update_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
    body: Bytes,
) -> Result<Json<DatasetMetadata>, ApiError> {
    let service = api.tenant(&path.account)?;
    let req: UpdateDatasetRequest = decode(&body)?;
    Ok(Json(service.update_dataset(&ctx, &path.group, &path.id, req).await?))
}

pub(crate) async fn promote_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
    body: Bytes,
) -> Result<Json<DatasetMetadata>, ApiError> {
    let service = api.tenant(&path.account)?;
    let req: PromoteDatasetRequest = decode(&body)?;
    Ok(Json(service.promote_dataset(&ctx, &path.group, &path.id, req).await?))
}

pub(crate) async fn delete_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
) -> Result<StatusCode, ApiError> {
    let service = api.tenant(&path.account)?;
    service.delete_dataset(&ctx, &path.group, &path.id).await?;
    api.metrics.datasets_deleted.inc();
    Ok(StatusCode::OK)
}
