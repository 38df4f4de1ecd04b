//! HTTP routes for the gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, Extensions, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info_span};
use uuid::Uuid;

use super::service::Gateway;
use crate::counter::CounterOp;
use crate::error::KeygateError;
use crate::ratelimit::RequestContext;

/// Body of every successful counter response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValueResponse {
    pub value: i64,
}

#[derive(Debug, Serialize)]
struct RateLimitedBody {
    error: &'static str,
    #[serde(rename = "retryAfter")]
    retry_after: f64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

#[derive(Debug, Deserialize)]
struct AmountParams {
    #[serde(default = "default_amount")]
    amount: i64,
}

fn default_amount() -> i64 {
    1
}

/// Build the gateway's HTTP router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/{key}/value", get(get_value))
        .route("/{key}/increment", post(increment))
        .route("/{key}/decrement", post(decrement))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %Uuid::new_v4(),
            )
        }))
        .with_state(gateway)
}

fn request_context(key: String, extensions: &Extensions) -> RequestContext {
    let client_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    RequestContext::new(key, client_addr)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn get_value(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
    extensions: Extensions,
) -> Result<Json<ValueResponse>, KeygateError> {
    let ctx = request_context(key, &extensions);
    let value = gateway.handle_request(&ctx, CounterOp::Read).await?;
    Ok(Json(ValueResponse { value }))
}

async fn increment(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
    uri: Uri,
    extensions: Extensions,
) -> Result<Json<ValueResponse>, KeygateError> {
    let op = parse_amount(&uri).map(CounterOp::Increment);
    let value = apply_parsed(&gateway, key, &extensions, op).await?;
    Ok(Json(ValueResponse { value }))
}

async fn decrement(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
    uri: Uri,
    extensions: Extensions,
) -> Result<Json<ValueResponse>, KeygateError> {
    let op = parse_amount(&uri).map(CounterOp::Decrement);
    let value = apply_parsed(&gateway, key, &extensions, op).await?;
    Ok(Json(ValueResponse { value }))
}

/// Query parsing is deferred to the handler so a malformed request still
/// goes through admission for its key.
fn parse_amount(uri: &Uri) -> Result<i64, KeygateError> {
    Query::<AmountParams>::try_from_uri(uri)
        .map(|Query(params)| params.amount)
        .map_err(|rejection| KeygateError::InvalidRequest(rejection.body_text()))
}

async fn apply_parsed(
    gateway: &Gateway,
    key: String,
    extensions: &Extensions,
    op: Result<CounterOp, KeygateError>,
) -> Result<i64, KeygateError> {
    let ctx = request_context(key, extensions);
    let (limiter_key, counter_key) = gateway.resolve_keys(&ctx);
    gateway.admit_then(&limiter_key, &counter_key, op).await
}

impl IntoResponse for KeygateError {
    fn into_response(self) -> Response {
        match self {
            KeygateError::RateLimited { retry_after_ms } => {
                let body = RateLimitedBody {
                    error: "Rate limit exceeded",
                    retry_after: retry_after_ms as f64 / 1000.0,
                };
                let retry_secs = retry_after_ms.div_ceil(1000).max(1);
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
                response
            }
            KeygateError::InvalidRequest(reason) => {
                debug!(reason = %reason, "Invalid request");
                (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorBody {
                        error: "Invalid request",
                    }),
                )
                    .into_response()
            }
            err if err.is_storage_failure() => {
                error!(error = %err, "Storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "Storage failure",
                    }),
                )
                    .into_response()
            }
            err => {
                error!(error = %err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "Internal error",
                    }),
                )
                    .into_response()
            }
        }
    }
}
