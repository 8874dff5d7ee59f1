use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chat_relay_error::{ProblemDetails, RelayError};
use serde::Serialize;

use crate::relay::{Caller, ChatRelay};
use crate::request::{ChatRequest, ChatRequestBody};
use crate::sse;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const SESSION_CREATED_HEADER: &str = "x-session-created";
const ACCEL_BUFFERING_HEADER: &str = "x-accel-buffering";
const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    active_streams: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        problem_response(problem)
    }
}

pub fn build_router(relay: Arc<ChatRelay>) -> Router {
    Router::new()
        .route("/v1/health", get(get_health))
        .route("/v1/chat/stream", post(post_chat_stream))
        .route("/v1/chat/:session_id/abort", post(post_abort))
        .fallback(not_found)
        .with_state(relay)
}

async fn get_health(State(relay): State<Arc<ChatRelay>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        active_streams: relay.active_streams(),
    })
}

async fn post_chat_stream(
    State(relay): State<Arc<ChatRelay>>,
    request: Request,
) -> Result<Response, ApiError> {
    let caller = caller_from_headers(request.headers())?;
    let chat = read_chat_request(&relay, request).await?;
    let turn = relay.prepare(caller, chat).await?;
    let stream = relay.start(turn)?;

    let mut response = Response::new(Body::from_stream(stream.body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(sse::CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(sse::CACHE_CONTROL));
    headers.insert(
        HeaderName::from_static(ACCEL_BUFFERING_HEADER),
        HeaderValue::from_static("no"),
    );
    if let Ok(value) = HeaderValue::from_str(&stream.session_id) {
        headers.insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(SESSION_CREATED_HEADER),
        HeaderValue::from_static(if stream.created { "true" } else { "false" }),
    );
    Ok(response)
}

async fn post_abort(
    State(relay): State<Arc<ChatRelay>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let caller = caller_from_headers(&headers)?;
    relay.abort(&caller.user_id, &session_id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn read_chat_request(relay: &ChatRelay, request: Request) -> Result<ChatRequest, RelayError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        let Json(body) = Json::<ChatRequestBody>::from_request(request, &())
            .await
            .map_err(|rejection| RelayError::invalid_request(rejection.body_text()))?;
        return ChatRequest::from_body(body);
    }

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|rejection| RelayError::invalid_request(rejection.body_text()))?;
        return ChatRequest::from_multipart(
            multipart,
            relay.preprocessor(),
            relay.config().attachment_budget_bytes,
        )
        .await;
    }

    Err(RelayError::UnsupportedMediaType {
        message: if content_type.is_empty() {
            "content-type is required".to_string()
        } else {
            format!("unsupported content-type `{content_type}`")
        },
    })
}

fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, RelayError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RelayError::Unauthenticated {
            message: format!("missing {USER_ID_HEADER} header"),
        })?;

    let auth_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    Ok(Caller {
        user_id: user_id.to_string(),
        auth_token,
    })
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::from(RelayError::NotFound {
        path: uri.path().to_string(),
    })
}

fn problem_response(problem: ProblemDetails) -> Response {
    let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)],
        Json(problem),
    )
        .into_response()
}
