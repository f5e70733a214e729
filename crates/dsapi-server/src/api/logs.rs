use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Serialize;

use dsapi_engine::cloud::LogEvent;
use dsapi_engine::RequestContext;

use super::{ApiError, DatasetPath, DsApi};

#[derive(Debug, Serialize)]
pub(crate) struct LogsResponse {
    events: Vec<LogEvent>,
}

pub(crate) async fn list_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
) -> Result<Json<LogsResponse>, ApiError> {
    let service = api.tenant(&path.account)?;
    let events = service.log_events(&ctx, &path.group, &path.id).await?;
    Ok(Json(LogsResponse { events }))
}
