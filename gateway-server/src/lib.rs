//! Thin northbound wiring: an `axum::Router` that extracts the identifiers
//! spec requires (API key, platform hint, sticky session id), resolves
//! identity through `gateway-auth`, asks `gateway-proxy` to run the
//! request, and records usage through `gateway-billing`. Per-provider
//! request/response dialect translation is `gateway-providers`'
//! responsibility; this layer only does enough parsing to route and bill.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use gateway_auth::Authenticator;
use gateway_billing::BillingPipeline;
use gateway_core::{ErrorEnvelope, GatewayError, Platform, RequestId, UsageDraft};
use gateway_proxy::{ProxyEngine, ProxyRequest};
use serde_json::Value;

pub struct AppState {
    pub auth: Authenticator,
    pub proxy: ProxyEngine,
    pub billing: BillingPipeline,
    pub max_body_size: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(claude_messages))
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .with_state(state)
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .or_else(|| headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()))
}

fn sticky_session_id(headers: &HeaderMap) -> Option<String> {
    headers.get("x-session-id").and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn model_from_body(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_default()
}

async fn handle_request(
    state: Arc<AppState>,
    platform: Platform,
    upstream_path: String,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if body.len() > state.max_body_size {
        return error_response(GatewayError::new(
            gateway_core::ErrorKind::Validation,
            "BODY_TOO_LARGE",
            format!("request body exceeds {} bytes", state.max_body_size),
        ));
    }

    let credential = match extract_bearer(&headers) {
        Some(c) => c,
        None => return error_response(GatewayError::unknown_api_key()),
    };

    let ctx = match state.auth.authenticate(credential).await {
        Ok(ctx) => ctx,
        Err(err) => return error_response(err.into()),
    };

    let model = model_from_body(&body);
    let stream = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false);

    let request_id = RequestId::from(uuid::Uuid::new_v4().to_string());

    let proxy_req = ProxyRequest {
        user_id: ctx.user_id.clone(),
        user_concurrency_limit: i64::MAX,
        platform,
        allowed_group_ids: ctx.allowed_group_ids.clone(),
        sticky_session_id: sticky_session_id(&headers),
        model: model.clone(),
        upstream_path,
        body: body.to_vec(),
        stream,
    };

    let outcome = match state.proxy.execute(&proxy_req).await {
        Ok(outcome) => outcome,
        Err(err) => return error_response(err),
    };

    let draft = UsageDraft {
        request_id,
        api_key_id: ctx.api_key_id,
        user_id: ctx.user_id,
        account_id: outcome.account_id,
        model: outcome.model.unwrap_or(model),
        group_id: ctx.bound_group_id.or_else(|| ctx.allowed_group_ids.first().cloned()),
        usage: outcome.usage,
        stream: outcome.stream,
        duration_ms: outcome.duration_ms,
        first_token_ms: outcome.first_token_ms,
        rate_multiplier: 1.0,
    };

    let content_type = outcome.content_type.unwrap_or_else(|| "application/json".to_string());
    let response_body = outcome.response_body;

    if let Err(err) = state.billing.record(draft).await {
        tracing::warn!(%err, "failed to record usage for completed request");
    }

    (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, content_type)], response_body).into_response()
}

async fn claude_messages(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> axum::response::Response {
    handle_request(state, Platform::Claude, "/v1/messages".to_string(), headers, body).await
}

async fn openai_chat_completions(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> axum::response::Response {
    handle_request(state, Platform::OpenAi, "/v1/chat/completions".to_string(), headers, body).await
}

async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    handle_request(state, Platform::Gemini, format!("/v1beta/models/{model_action}"), headers, body).await
}

fn error_response(err: GatewayError) -> axum::response::Response {
    let envelope: ErrorEnvelope = err.to_envelope();
    let status = StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope)).into_response()
}
