//! Public /v1 surface.

use std::convert::Infallible;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_stream::wrappers::ReceiverStream;

use kgate_core::engine::{ApiDialect, EngineResponse};
use kgate_core::{AppState, AuthContext, EngineError, auth};
use kgate_protocol::anthropic::MessagesRequest;
use kgate_protocol::openai::ChatCompletionRequest;

pub fn proxy_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/models", get(models_list))
        .route("/health", get(health))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(auth) = authenticate(&state, &headers) else {
        return error_response(
            &EngineError::Auth("missing or invalid API key".to_string()),
            ApiDialect::OpenAi,
        );
    };
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                &EngineError::InvalidRequest(format!("invalid json: {err}")),
                ApiDialect::OpenAi,
            );
        }
    };
    match state.engine.chat_completions(auth, request).await {
        Ok(response) => engine_response(response),
        Err(err) => error_response(&err, ApiDialect::OpenAi),
    }
}

async fn messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(auth) = authenticate(&state, &headers) else {
        return error_response(
            &EngineError::Auth("missing or invalid API key".to_string()),
            ApiDialect::Anthropic,
        );
    };
    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                &EngineError::InvalidRequest(format!("invalid json: {err}")),
                ApiDialect::Anthropic,
            );
        }
    };
    match state.engine.messages(auth, request).await {
        Ok(response) => engine_response(response),
        Err(err) => error_response(&err, ApiDialect::Anthropic),
    }
}

async fn models_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if authenticate(&state, &headers).is_none() {
        return error_response(
            &EngineError::Auth("missing or invalid API key".to_string()),
            ApiDialect::OpenAi,
        );
    }
    Json(state.engine.model_list()).into_response()
}

async fn health() -> Response {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": timestamp,
    }))
    .into_response()
}

/// Keys arrive as `Authorization: Bearer <key>` or `x-api-key: <key>`.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<AuthContext> {
    let presented = extract_key(headers)?;
    auth::resolve(&state.config.proxy_api_key, &presented, &state.engine.keys)
}

fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
    {
        let raw = raw.trim();
        let prefix = "Bearer ";
        if raw.len() > prefix.len() && raw[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = raw[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = headers.get("x-api-key")
        && let Ok(raw) = value.to_str()
    {
        let raw = raw.trim();
        if !raw.is_empty() {
            return Some(raw.to_string());
        }
    }
    None
}

fn engine_response(response: EngineResponse) -> Response {
    match response {
        EngineResponse::Json(value) => Json(value).into_response(),
        EngineResponse::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            let mut response = Response::new(Body::from_stream(stream));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(
                header::CACHE_CONTROL,
                header::HeaderValue::from_static("no-cache"),
            );
            // Hint common reverse proxies to avoid buffering SSE responses.
            headers.insert(
                header::HeaderName::from_static("x-accel-buffering"),
                header::HeaderValue::from_static("no"),
            );
            response
        }
    }
}

fn error_response(err: &EngineError, dialect: ApiDialect) -> Response {
    let status =
        StatusCode::from_u16(err.status(dialect)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.body(dialect))).into_response()
}
