//! HTTP API Tests
//!
//! Drives the router in-process and checks status codes, bodies and
//! basic auth.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{bind_body, provision_body, Harness};
use osbroker::api::{router, BasicAuth};
use osbroker::domain::InstanceStatus;
use osbroker::services::fake::{SERVICE_ID, STANDARD_PLAN_ID};

fn app(harness: &Harness) -> Router {
    router(
        harness.lifecycle.clone(),
        Some(BasicAuth::new("admin", "secret")),
    )
}

fn authorized(method: &str, uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("admin:secret")),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_requires_basic_auth() {
    let h = Harness::new();

    let anonymous = Request::builder()
        .uri("/v2/catalog")
        .body(Body::empty())
        .unwrap();
    let response = app(&h).oneshot(anonymous).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let wrong = Request::builder()
        .uri("/v2/catalog")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("admin:wrong")),
        )
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h), wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn test_healthz_is_public() {
    let h = Harness::new();
    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_catalog() {
    let h = Harness::new();
    let (status, body) = send(app(&h), authorized("GET", "/v2/catalog", Vec::new())).await;

    assert_eq!(status, StatusCode::OK);
    let service = &body["services"][0];
    assert_eq!(service["id"], SERVICE_ID);
    assert_eq!(service["bindable"], true);
    assert_eq!(service["plans"][0]["id"], STANDARD_PLAN_ID);
    assert!(service["plans"][0]["schemas"]["service_binding"]["create"]["parameters"].is_object());
}

#[tokio::test]
async fn test_provision_status_codes() {
    let h = Harness::new();
    let uri = "/v2/service_instances/i-1?accepts_incomplete=true";

    let (status, body) = send(app(&h), authorized("PUT", uri, provision_body(json!({})))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["operation"], "provisioning");

    // Still provisioning, so a repeat conflicts
    let (status, body) = send(app(&h), authorized("PUT", uri, provision_body(json!({})))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, json!({}));

    let (status, _) = send(
        app(&h),
        authorized(
            "PUT",
            "/v2/service_instances/i-2",
            provision_body(json!({})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(
        app(&h),
        authorized("PUT", "/v2/service_instances/i-3?accepts_incomplete=true", b"{oops".to_vec()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "MalformedRequest");
}

#[tokio::test]
async fn test_schema_violation_body() {
    let h = Harness::new();
    let (status, body) = send(
        app(&h),
        authorized(
            "PUT",
            "/v2/service_instances/i-1?accepts_incomplete=true",
            provision_body(json!({ "size": 3 })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({ "error": "size", "description": "field is not recognized" })
    );
}

#[tokio::test]
async fn test_bind_and_unbind() {
    let h = Harness::new();
    h.seed_instance("i-1", InstanceStatus::Provisioned).await;
    let uri = "/v2/service_instances/i-1/service_bindings/b-1";

    let (status, created) = send(app(&h), authorized("PUT", uri, bind_body(json!({})))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["credentials"]["bindingId"], "b-1");

    let (status, replayed) = send(app(&h), authorized("PUT", uri, bind_body(json!({})))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replayed, created);

    let (status, _) = send(
        app(&h),
        authorized(
            "PUT",
            "/v2/service_instances/missing/service_bindings/b-2",
            bind_body(json!({})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(app(&h), authorized("DELETE", uri, Vec::new())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, body) = send(app(&h), authorized("DELETE", uri, Vec::new())).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn test_deprovision_and_last_operation() {
    let h = Harness::new();
    h.seed_instance("i-1", InstanceStatus::Provisioned).await;

    let (status, body) = send(
        app(&h),
        authorized(
            "GET",
            "/v2/service_instances/i-1/last_operation",
            Vec::new(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "succeeded");

    let uri = format!(
        "/v2/service_instances/i-1?accepts_incomplete=true&service_id={}&plan_id={}",
        SERVICE_ID, STANDARD_PLAN_ID
    );
    let (status, body) = send(app(&h), authorized("DELETE", &uri, Vec::new())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["operation"], "deprovisioning");

    let (status, body) = send(
        app(&h),
        authorized(
            "GET",
            "/v2/service_instances/i-1/last_operation",
            Vec::new(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "in progress");

    let (status, _) = send(
        app(&h),
        authorized(
            "DELETE",
            "/v2/service_instances/gone?accepts_incomplete=true",
            Vec::new(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_bad_query_and_path_are_json_errors() {
    let h = Harness::new();

    let (status, body) = send(
        app(&h),
        authorized(
            "PUT",
            "/v2/service_instances/i-1?accepts_incomplete=yes",
            provision_body(json!({})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "MalformedRequest");
    assert!(body["description"].is_string());

    // Not valid UTF-8 once percent-decoded
    let (status, body) = send(
        app(&h),
        authorized(
            "GET",
            "/v2/service_instances/%FF/last_operation",
            Vec::new(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "MalformedRequest");
}
