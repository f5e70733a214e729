use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::ObjectStoreRepository;
use crate::context::RequestContext;
use crate::error::{DsError, Result};
use crate::repository::Attachment;

/// Reserved key prefix of attachments inside a container.
pub const ATTACHMENT_PREFIX: &str = "_attachments/";

/// Largest accepted attachment, in bytes.
pub const MAX_ATTACHMENT_SIZE: usize = 32 << 20;

/// Validity of attachment retrieval URLs.
pub const ATTACHMENT_URL_TTL: Duration = Duration::from_secs(300);

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(DsError::BadRequest(format!("invalid attachment name {:?}", name)));
    }
    Ok(())
}

fn attachment_key(name: &str) -> String {
    format!("{}{}", ATTACHMENT_PREFIX, name)
}

impl ObjectStoreRepository {
    pub(super) async fn put_attachment(&self, ctx: &RequestContext, id: &str, name: &str, body: Bytes) -> Result<()> {
        validate_name(name)?;
        if body.len() > MAX_ATTACHMENT_SIZE {
            return Err(DsError::BadRequest(format!(
                "attachment {} is {} bytes, limit is {}",
                name,
                body.len(),
                MAX_ATTACHMENT_SIZE
            )));
        }
        let container = self.container_name(id);
        let key = attachment_key(name);
        match ctx.call(self.storage.head_object(&container, &key)).await {
            Ok(_) => return Err(DsError::Conflict(format!("attachment {} already exists", name))),
            Err(DsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let size = body.len();
        ctx.call(self.storage.put_object(&container, &key, body)).await?;
        info!(request_id = ctx.request_id(), dataset = id, attachment = name, size, "attachment stored");
        Ok(())
    }

    pub(super) async fn attachments(&self, ctx: &RequestContext, id: &str, show_urls: bool) -> Result<Vec<Attachment>> {
        let container = self.container_name(id);
        let objects = ctx
            .call(self.storage.list_objects(&container, ATTACHMENT_PREFIX))
            .await?;

        let mut out = Vec::with_capacity(objects.len());
        for object in objects {
            let name = match object.key.strip_prefix(ATTACHMENT_PREFIX) {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => continue,
            };
            let url = if show_urls {
                match ctx
                    .call(self.storage.presign_get(&container, &object.key, ATTACHMENT_URL_TTL))
                    .await
                {
                    Ok(url) => Some(url),
                    Err(DsError::Cancelled) => return Err(DsError::Cancelled),
                    Err(e) => {
                        warn!(container = %container, key = %object.key, error = %e, "cannot presign attachment url");
                        None
                    }
                }
            } else {
                None
            };
            out.push(Attachment {
                name,
                modified: object.last_modified,
                size: object.size,
                url,
            });
        }
        debug!(container = %container, count = out.len(), "attachments listed");
        Ok(out)
    }

    pub(super) async fn remove_attachment(&self, ctx: &RequestContext, id: &str, name: &str) -> Result<()> {
        validate_name(name)?;
        let container = self.container_name(id);
        let key = attachment_key(name);
        ctx.call(self.storage.head_object(&container, &key))
            .await
            .map_err(|e| match e {
                DsError::NotFound(_) => DsError::NotFound(format!("attachment {} not found", name)),
                other => other,
            })?;
        ctx.call(self.storage.delete_object(&container, &key)).await?;
        info!(request_id = ctx.request_id(), dataset = id, attachment = name, "attachment deleted");
        Ok(())
    }
}
