use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use bytes::Bytes;
use serde::Deserialize;

use dsapi_engine::repository::AccessMap;
use dsapi_engine::{DsError, RequestContext};

use super::{decode, ApiError, DatasetPath, DsApi};

#[derive(Debug, Deserialize)]
struct GrantRequest {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstancePath {
    account: String,
    group: String,
    id: String,
    instance_id: String,
}

pub(crate) async fn list_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
) -> Result<Json<AccessMap>, ApiError> {
    let service = api.tenant(&path.account)?;
    Ok(Json(service.list_access(&ctx, &path.id).await?))
}

pub(crate) async fn grant_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
    body: Bytes,
) -> Result<Json<AccessMap>, ApiError> {
    let service = api.tenant(&path.account)?;
    let req: GrantRequest = decode(&body)?;
    if req.instance_id.is_empty() {
        return Err(ApiError(DsError::BadRequest("instance_id is required".to_string())));
    }
    Ok(Json(
        service
            .grant_access(&ctx, &path.group, &path.id, &req.instance_id)
            .await?,
    ))
}

pub(crate) async fn revoke_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<InstancePath>,
) -> Result<StatusCode, ApiError> {
    let service = api.tenant(&path.account)?;
    service
        .revoke_access(&ctx, &path.group, &path.id, &path.instance_id)
        .await?;
    Ok(StatusCode::OK)
}
