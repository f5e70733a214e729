use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};

use dsapi_engine::repository::{CreatedUser, UpdatedUser, UserMap};
use dsapi_engine::{DsError, RequestContext};

use super::{ApiError, DatasetPath, DsApi};

/// A dataset without a temporary group lists as empty.
pub(crate) async fn list_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
) -> Result<Json<UserMap>, ApiError> {
    let service = api.tenant(&path.account)?;
    // the dataset itself must exist; only a missing group is swallowed
    service.metadata(&ctx, &path.id).await?;
    match service.list_users(&ctx, &path.id).await {
        Ok(users) => Ok(Json(users)),
        Err(DsError::NotFound(_)) => Ok(Json(UserMap::new())),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn create_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
) -> Result<Json<CreatedUser>, ApiError> {
    let service = api.tenant(&path.account)?;
    Ok(Json(service.create_user(&ctx, &path.group, &path.id).await?))
}

pub(crate) async fn update_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
) -> Result<Json<UpdatedUser>, ApiError> {
    let service = api.tenant(&path.account)?;
    Ok(Json(service.update_user(&ctx, &path.group, &path.id).await?))
}

pub(crate) async fn delete_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
) -> Result<StatusCode, ApiError> {
    let service = api.tenant(&path.account)?;
    service.delete_user(&ctx, &path.group, &path.id).await?;
    Ok(StatusCode::OK)
}
