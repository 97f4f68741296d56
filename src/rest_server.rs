use crate::error::TransporterError;
use crate::models::Subscriber;
use crate::transport::Transport;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::{header, StatusCode};
use tracing::{debug, error, info};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;
const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";

type AppState = Arc<Transport>;

impl IntoResponse for TransporterError {
    fn into_response(self) -> Response {
        let status = match &self {
            TransporterError::Validation(_)
            | TransporterError::NotFound(_)
            | TransporterError::Conflict(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("{}", self);
        }
        (status, self.to_string()).into_response()
    }
}

type ApiResult<T> = Result<T, TransporterError>;

#[derive(Deserialize)]
struct KeystoreQuery {
    #[serde(rename = "secKey", default)]
    sec_key: String,
}

fn text(body: impl Into<String>) -> Response {
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body.into()).into_response()
}

fn require_id(id: &str) -> ApiResult<()> {
    if id.trim().is_empty() {
        return Err(TransporterError::validation("ID must not be null"));
    }
    Ok(())
}

async fn list_subscribers(State(transport): State<AppState>) -> Json<Vec<Subscriber>> {
    Json(transport.list_subscribers().await)
}

async fn add_subscriber(
    State(transport): State<AppState>,
    Json(subscriber): Json<Subscriber>,
) -> ApiResult<Response> {
    let id = transport.add_subscriber(subscriber).await?;
    Ok(text(id))
}

async fn get_subscriber(
    State(transport): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Subscriber>> {
    require_id(&id)?;
    Ok(Json(transport.get_subscriber(&id).await?))
}

async fn set_subscriber(
    State(transport): State<AppState>,
    Path(id): Path<String>,
    Json(subscriber): Json<Subscriber>,
) -> ApiResult<StatusCode> {
    require_id(&id)?;
    if subscriber.id != id {
        return Err(TransporterError::validation("ID of subscriber does not match"));
    }
    transport.set_subscriber(subscriber).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_subscriber(
    State(transport): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_id(&id)?;
    transport.delete_subscriber(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_passphrase(State(transport): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let token = transport.issue_passphrase_token(&body)?;
    Ok(text(token))
}

async fn has_trusted(State(transport): State<AppState>, Path(id): Path<String>) -> Response {
    text(transport.has_trust_anchor(&id).await.to_string())
}

async fn set_trusted(
    State(transport): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    transport.set_trust_anchor(&id, &body).await?;
    Ok(StatusCode::OK)
}

async fn delete_trusted(
    State(transport): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    transport.delete_trust_anchor(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn has_keystore(State(transport): State<AppState>, Path(id): Path<String>) -> Response {
    text(transport.has_keystore(&id).await.to_string())
}

async fn set_keystore(
    State(transport): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<KeystoreQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    transport.set_keystore(&id, &body, &query.sec_key).await?;
    Ok(StatusCode::OK)
}

async fn delete_keystore(
    State(transport): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    transport.delete_keystore(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn metrics(State(transport): State<AppState>) -> impl IntoResponse {
    Json(transport.metrics())
}

pub fn router(transport: Arc<Transport>) -> Router {
    Router::new()
        .route("/rest/subscribers", get(list_subscribers).post(add_subscriber))
        .route("/rest/subscribers/metrics", get(metrics))
        .route("/rest/subscribers/certs/passphrase", post(set_passphrase))
        .route(
            "/rest/subscribers/{id}",
            get(get_subscriber)
                .put(set_subscriber)
                .delete(delete_subscriber),
        )
        .route(
            "/rest/subscribers/{id}/certs/trust",
            get(has_trusted).post(set_trusted).delete(delete_trusted),
        )
        .route(
            "/rest/subscribers/{id}/certs/keystore",
            get(has_keystore).post(set_keystore).delete(delete_keystore),
        )
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(transport)
}

/// Serves the REST API on `bind` until `shutdown` resolves.
pub async fn run_rest_server<F>(
    transport: Arc<Transport>,
    bind: &str,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("REST API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(transport))
        .with_graceful_shutdown(shutdown)
        .await?;
    debug!("REST API stopped");
    Ok(())
}
