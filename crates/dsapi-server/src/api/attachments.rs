use std::sync::Arc;

use axum::{
    extract::{multipart::Field, Multipart, Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tracing::debug;

use dsapi_engine::objstore::MAX_ATTACHMENT_SIZE;
use dsapi_engine::repository::Attachment;
use dsapi_engine::{DsError, RequestContext};

use super::{decode, ApiError, DatasetPath, DsApi};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    show_urls: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AttachmentPath {
    account: String,
    group: String,
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    name: String,
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError(DsError::BadRequest(format!("bad multipart body: {}", e)))
}

/// Reads one file part, failing as soon as it outgrows the per-file limit.
async fn read_file(mut field: Field<'_>, name: &str) -> Result<Bytes, ApiError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if buf.len() + chunk.len() > MAX_ATTACHMENT_SIZE {
            return Err(ApiError(DsError::BadRequest(format!(
                "attachment {} exceeds {} bytes",
                name, MAX_ATTACHMENT_SIZE
            ))));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

pub(crate) async fn create_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
    mut multipart: Multipart,
) -> Result<Json<Vec<String>>, ApiError> {
    let service = api.tenant(&path.account)?;
    let mut stored = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = match field.file_name().or(field.name()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let body = read_file(field, &name).await?;
        debug!(dataset = %path.id, attachment = %name, size = body.len(), "attachment received");
        service
            .create_attachment(&ctx, &path.group, &path.id, &name, body)
            .await?;
        stored.push(name);
    }
    if stored.is_empty() {
        return Err(ApiError(DsError::BadRequest("no file in request".to_string())));
    }
    Ok(Json(stored))
}

pub(crate) async fn list_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Attachment>>, ApiError> {
    let service = api.tenant(&path.account)?;
    Ok(Json(service.list_attachments(&ctx, &path.id, query.show_urls).await?))
}

pub(crate) async fn delete_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<AttachmentPath>,
) -> Result<StatusCode, ApiError> {
    let service = api.tenant(&path.account)?;
    service
        .delete_attachment(&ctx, &path.group, &path.id, &path.name)
        .await?;
    Ok(StatusCode::OK)
}

pub(crate) async fn delete_by_body_handler(
    State(api): State<Arc<DsApi>>,
    Extension(ctx): Extension<RequestContext>,
    Path(path): Path<DatasetPath>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let service = api.tenant(&path.account)?;
    let req: DeleteRequest = decode(&body)?;
    service
        .delete_attachment(&ctx, &path.group, &path.id, &req.name)
        .await?;
    Ok(StatusCode::OK)
}
