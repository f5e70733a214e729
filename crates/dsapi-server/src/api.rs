//! HTTP surface under `/v1/ds`.
//!
//! `ping`, `version` and `metrics` are public; everything else needs the
//! shared secret in `X-Auth-Token`. Each request runs under its own
//! [`RequestContext`], cancelled when the handler future completes or is
//! dropped, so engine calls and audit pipes never outlive their request.

mod attachments;
mod datasets;
mod instances;
mod logs;
mod users;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use dsapi_engine::{DsError, ErrorKind, RequestContext, Service};

use crate::config::{ConfigError, DsApiConfig, VersionInfo};
use crate::metrics::ApiMetrics;
use crate::security::{constant_time_eq, security_headers_middleware, AUTH_HEADER};
use crate::tenants::Tenants;

/// Largest accepted request body.
pub const MAX_REQUEST_BODY: usize = 50 << 20;

/// Longest wait for the next chunk of a request body.
///
/// Handlers themselves are bounded by the engine's retry budgets; a profile
/// swap may legitimately back off for longer than this.
pub const BODY_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Engine error rendered as `{"error": <kind>, "message": <text>}`.
#[derive(Debug)]
pub struct ApiError(pub DsError);

impl From<DsError> for ApiError {
    fn from(err: DsError) -> Self {
        Self(err)
    }
}

/// Status code of an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::ServiceUnavailable | ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if kind == ErrorKind::Internal {
            error!(error = %self.0, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": kind.as_str(),
            "message": self.0.message(),
        }));
        let mut response = (status_for(kind), body).into_response();
        response.extensions_mut().insert(kind);
        response
    }
}

/// Decodes a JSON body, reporting shape errors as `BadRequest`.
pub(crate) fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError(DsError::from(e)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct GroupPath {
    pub(crate) account: String,
    pub(crate) group: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DatasetPath {
    pub(crate) account: String,
    pub(crate) group: String,
    pub(crate) id: String,
}

/// The dataset API server.
pub struct DsApi {
    tenants: Tenants,
    token: String,
    version: VersionInfo,
    addr: SocketAddr,
    metrics: Arc<ApiMetrics>,
}

impl DsApi {
    /// Creates a server for `tenants` using the listener, token and version of `config`.
    pub fn new(config: &DsApiConfig, tenants: Tenants) -> Result<Self, ConfigError> {
        Ok(Self {
            tenants,
            token: config.token.clone(),
            version: config.version.clone(),
            addr: config.socket_addr()?,
            metrics: Arc::new(ApiMetrics::new()),
        })
    }

    /// Counters of this server.
    pub fn metrics(&self) -> Arc<ApiMetrics> {
        Arc::clone(&self.metrics)
    }

    pub(crate) fn tenant(&self, account: &str) -> Result<Arc<Service>, ApiError> {
        self.tenants
            .get(account)
            .ok_or_else(|| ApiError(DsError::NotFound(format!("account {} not found", account))))
    }

    /// The router with every route and layer in place.
    pub fn router(self: Arc<Self>) -> Router {
        let dataset = "/:account/datasets/:group/:id";
        let protected = Router::new()
            .route(
                "/:account/datasets/:group",
                get(datasets::list_handler).post(datasets::create_handler),
            )
            .route(
                dataset,
                get(datasets::show_handler)
                    .put(datasets::update_handler)
                    .patch(datasets::promote_handler)
                    .delete(datasets::delete_handler),
            )
            .route(
                &format!("{}/attachments", dataset),
                get(attachments::list_handler)
                    .post(attachments::create_handler)
                    .delete(attachments::delete_by_body_handler),
            )
            .route(
                &format!("{}/attachments/:name", dataset),
                delete(attachments::delete_handler),
            )
            .route(
                &format!("{}/instances", dataset),
                get(instances::list_handler).post(instances::grant_handler),
            )
            .route(
                &format!("{}/instances/:instance_id", dataset),
                delete(instances::revoke_handler),
            )
            .route(
                &format!("{}/users", dataset),
                get(users::list_handler)
                    .post(users::create_handler)
                    .put(users::update_handler)
                    .delete(users::delete_handler),
            )
            .route(&format!("{}/logs", dataset), get(logs::list_handler))
            .layer(axum::middleware::from_fn_with_state(self.clone(), auth_middleware))
            .layer(axum::middleware::from_fn(request_scope));

        let public = Router::new()
            .route("/ping", get(ping_handler))
            .route("/version", get(version_handler))
            .route("/metrics", get(metrics_handler));

        Router::new()
            .nest("/v1/ds", public.merge(protected))
            .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
            .layer(axum::middleware::from_fn(security_headers_middleware))
            .layer(axum::middleware::from_fn_with_state(self.clone(), track_responses))
            .layer(RequestBodyTimeoutLayer::new(BODY_READ_TIMEOUT))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Serves until interrupted.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "dataset API listening");

        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn ping_handler() -> &'static str {
    "pong"
}

async fn version_handler(State(api): State<Arc<DsApi>>) -> Json<VersionInfo> {
    Json(api.version.clone())
}

async fn metrics_handler(State(api): State<Arc<DsApi>>) -> (StatusCode, String) {
    (StatusCode::OK, api.metrics.render_prometheus())
}

async fn request_scope(mut request: Request, next: Next) -> Response {
    let ctx = RequestContext::new();
    let _cancel_on_exit = ctx.token().clone().drop_guard();
    request.extensions_mut().insert(ctx);
    next.run(request).await
}

async fn auth_middleware(State(api): State<Arc<DsApi>>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(provided, &api.token) {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "rejected request with a bad token");
    ApiError(DsError::Forbidden("missing or invalid token".to_string())).into_response()
}

async fn track_responses(State(api): State<Arc<DsApi>>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    api.metrics.record_status(response.status().as_u16());
    if let Some(kind) = response.extensions().get::<ErrorKind>() {
        api.metrics.record_error(*kind);
    }
    response
}
