#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use dsapi_engine::auditlog::CloudAuditLog;
use dsapi_engine::cloud::memory::SimulatedCloud;
use dsapi_engine::cloud::ObjectStorage;
use dsapi_engine::metadata::ObjectMetadataStore;
use dsapi_engine::objstore::{ObjectStoreRepository, ObjectStoreSettings, RetryBudgets};
use dsapi_engine::repository::StorageProvider;
use dsapi_engine::retry::RetryBudget;
use dsapi_engine::Service;
use dsapi_server::{DsApi, DsApiConfig, Tenants};

pub const TOKEN: &str = "test-token";
pub const ACCOUNT: &str = "tenantA";
pub const GROUP: &str = "grp";
pub const ORG: &str = "acme";
pub const PREFIX: &str = "ds";
pub const METADATA_BUCKET: &str = "dsapi-metadata";

pub struct Harness {
    pub cloud: Arc<SimulatedCloud>,
    pub api: Arc<DsApi>,
    pub router: Router,
}

fn fast_budgets() -> RetryBudgets {
    let quick = RetryBudget::new(3, Duration::from_millis(1));
    RetryBudgets {
        probe: quick,
        association: RetryBudget::new(5, Duration::from_millis(1)),
        detach: quick,
        identity_wait: RetryBudget::new(5, Duration::from_millis(1)),
    }
}

pub async fn harness() -> Harness {
    harness_with_budgets(fast_budgets()).await
}

pub async fn harness_with_budgets(budgets: RetryBudgets) -> Harness {
    let cloud = Arc::new(SimulatedCloud::for_tests());
    cloud.create_bucket(METADATA_BUCKET).await.unwrap();

    let repo = ObjectStoreRepository::new(
        cloud.clone(),
        cloud.clone(),
        cloud.clone(),
        ObjectStoreSettings {
            org: ORG.to_string(),
            prefix: Some(PREFIX.to_string()),
            logging_bucket: None,
        },
    )
    .with_budgets(budgets);

    let service = Service::new(
        ACCOUNT,
        ORG,
        Arc::new(ObjectMetadataStore::new(cloud.clone(), METADATA_BUCKET)),
        Arc::new(CloudAuditLog::new(cloud.clone(), Duration::from_secs(600))),
    )
    .with_provider("objstore", StorageProvider::with_attachments(Arc::new(repo)));

    let config = DsApiConfig::from_json(&format!(r#"{{"org": "{}", "token": "{}"}}"#, ORG, TOKEN)).unwrap();
    let api = Arc::new(DsApi::new(&config, Tenants::from_services([service])).unwrap());
    let router = api.clone().router();
    Harness { cloud, api, router }
}

pub fn dataset_uri(id: &str) -> String {
    format!("/v1/ds/{}/datasets/{}/{}", ACCOUNT, GROUP, id)
}

pub fn json_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Auth-Token", TOKEN);
    match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn multipart_request(uri: &str, file_name: &str, contents: Vec<u8>) -> Request<Body> {
    multipart_files(uri, vec![(file_name, contents)])
}

pub fn multipart_files(uri: &str, files: Vec<(&str, Vec<u8>)>) -> Request<Body> {
    let boundary = "dsapi-test-boundary";
    let mut body = Vec::new();
    for (file_name, contents) in files {
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                b = boundary,
                f = file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(&contents);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header("X-Auth-Token", TOKEN)
        .header("content-type", format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(body))
        .unwrap()
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };
    (status, value)
}

pub async fn create_dataset(router: &Router, derivative: bool) -> (String, String) {
    let (status, body) = send(
        router,
        json_request(
            "POST",
            &format!("/v1/ds/{}/datasets/{}", ACCOUNT, GROUP),
            Some(serde_json::json!({
                "name": "ds1",
                "type": "objstore",
                "derivative": derivative,
                "tags": [],
                "metadata": {"created_by": "alice", "data_format": "csv"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    (
        body["id"].as_str().unwrap().to_string(),
        body["repository"].as_str().unwrap().to_string(),
    )
}
