//! HTTP surface of the broker.
//!
//! Routes follow the Open Service Broker v2 layout. Everything except the
//! health check sits behind basic auth when credentials are configured.

pub mod auth;
pub mod response;

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::routing::{get, put};
use axum::{middleware, Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::core::lifecycle::DeclaredIds;
use crate::core::{ApiServer, Lifecycle, LifecycleError, Outcome};

pub use auth::BasicAuth;

/// Query parameters accepted by instance operations
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationQuery {
    #[serde(default)]
    pub accepts_incomplete: bool,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

impl OperationQuery {
    fn declared(&self) -> DeclaredIds {
        DeclaredIds {
            service_id: self.service_id.clone(),
            plan_id: self.plan_id.clone(),
        }
    }
}

/// `Query` whose rejection is a JSON `MalformedRequest`
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = LifecycleError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| LifecycleError::MalformedRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

/// `Path` whose rejection is a JSON `MalformedRequest`
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = LifecycleError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| LifecycleError::MalformedRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

type HandlerResult = Result<Outcome, LifecycleError>;

async fn catalog(State(lifecycle): State<Lifecycle>) -> Outcome {
    lifecycle.get_catalog()
}

async fn provision(
    State(lifecycle): State<Lifecycle>,
    ApiPath(instance_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<OperationQuery>,
    body: Bytes,
) -> HandlerResult {
    lifecycle
        .provision(&instance_id, query.accepts_incomplete, &body)
        .await
}

async fn update(
    State(lifecycle): State<Lifecycle>,
    ApiPath(instance_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<OperationQuery>,
    body: Bytes,
) -> HandlerResult {
    lifecycle
        .update(&instance_id, query.accepts_incomplete, &body)
        .await
}

async fn deprovision(
    State(lifecycle): State<Lifecycle>,
    ApiPath(instance_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<OperationQuery>,
) -> HandlerResult {
    lifecycle
        .deprovision(&instance_id, &query.declared(), query.accepts_incomplete)
        .await
}

async fn last_operation(
    State(lifecycle): State<Lifecycle>,
    ApiPath(instance_id): ApiPath<String>,
) -> HandlerResult {
    lifecycle.last_operation(&instance_id).await
}

async fn bind(
    State(lifecycle): State<Lifecycle>,
    ApiPath((instance_id, binding_id)): ApiPath<(String, String)>,
    body: Bytes,
) -> HandlerResult {
    lifecycle.bind(&instance_id, &binding_id, &body).await
}

async fn unbind(
    State(lifecycle): State<Lifecycle>,
    ApiPath((instance_id, binding_id)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<OperationQuery>,
) -> HandlerResult {
    lifecycle
        .unbind(&instance_id, &binding_id, &query.declared())
        .await
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the broker router
pub fn router(lifecycle: Lifecycle, auth: Option<BasicAuth>) -> Router {
    let mut protected = Router::new()
        .route("/v2/catalog", get(catalog))
        .route(
            "/v2/service_instances/:instance_id",
            put(provision).patch(update).delete(deprovision),
        )
        .route(
            "/v2/service_instances/:instance_id/last_operation",
            get(last_operation),
        )
        .route(
            "/v2/service_instances/:instance_id/service_bindings/:binding_id",
            put(bind).delete(unbind),
        )
        .with_state(lifecycle);

    if let Some(auth) = auth {
        protected = protected.layer(middleware::from_fn_with_state(
            auth,
            auth::require_basic_auth,
        ));
    }

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
}

/// Serves the router on a TCP port
pub struct HttpServer {
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(port: u16, lifecycle: Lifecycle, auth: Option<BasicAuth>) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            router: router(lifecycle, auth),
        }
    }
}

#[async_trait]
impl ApiServer for HttpServer {
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        tracing::info!(addr = %self.addr, "API server listening");

        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("API server failed")?;

        tracing::info!("API server stopped");
        Ok(())
    }
}
