//! Admin /api surface: credential and key CRUD, stats, logs, settings.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use kgate_core::AppState;
use kgate_core::bootstrap::{SETTING_PROXY, SETTING_SETTINGS};
use kgate_core::breaker::BreakerState;
use kgate_core::settings::RuntimeSettings;
use kgate_pool::Credential;
use kgate_upstream::refresh::refresh_credential;

pub fn admin_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/proxy/status", get(proxy_status))
        .route("/api/proxy/health", get(proxy_health))
        .route("/api/metrics", get(metrics))
        .with_state(state.clone());

    let private = Router::new()
        .route("/api/accounts", get(accounts_list).post(accounts_create))
        .route(
            "/api/accounts/{id}",
            get(accounts_get).put(accounts_update).delete(accounts_delete),
        )
        .route("/api/accounts/{id}/refresh", post(accounts_refresh))
        .route("/api/accounts/{id}/verify", post(accounts_verify))
        .route("/api/accounts/{id}/usage", get(accounts_usage))
        .route("/api/keys", get(keys_list).post(keys_create))
        .route(
            "/api/keys/{id}",
            get(keys_get).put(keys_update).delete(keys_delete),
        )
        .route("/api/proxy/stats", get(proxy_stats))
        .route("/api/proxy/logs", get(proxy_logs))
        .route("/api/proxy/config", get(config_get).put(config_put))
        .route("/api/settings", get(settings_get).put(settings_put))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state);

    public.merge(private)
}

async fn admin_auth(
    State(state): State<AppState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == state.config.admin_password);
    if !authorized {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

// ---- Accounts ----

#[derive(Debug, Deserialize)]
struct AccountBody {
    id: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    region: Option<String>,
    profile_arn: Option<String>,
    machine_id: Option<String>,
    subscription_tier: Option<String>,
    disabled: Option<bool>,
}

async fn accounts_list(State(state): State<AppState>) -> Response {
    Json(state.engine.pool.diagnostics()).into_response()
}

async fn accounts_create(State(state): State<AppState>, Json(body): Json<AccountBody>) -> Response {
    if body.access_token.is_none() && body.refresh_token.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "access_token or refresh_token required"})),
        )
            .into_response();
    }
    let cred = Credential {
        id: body.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        access_token: body.access_token.unwrap_or_default(),
        refresh_token: body.refresh_token,
        region: body.region.unwrap_or_else(|| "us-east-1".to_string()),
        profile_arn: body.profile_arn,
        machine_id: body.machine_id,
        subscription_tier: body.subscription_tier,
        expires_at: None,
        disabled: body.disabled.unwrap_or(false),
    };
    let id = cred.id.clone();
    state.engine.pool.add(cred);
    if state.engine.pool.get(&id).is_some_and(|c| c.access_token.is_empty()) {
        state.engine.pool.mark_needs_refresh(&id);
    }
    state.engine.persist_credential(&id);
    info!(event = "credential_created", credential_id = %id);
    (StatusCode::CREATED, Json(json!({"id": id}))).into_response()
}

async fn accounts_get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.pool.get(&id) {
        Some(cred) => Json(masked_credential(&cred)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn accounts_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AccountBody>,
) -> Response {
    let updated = state.engine.pool.update(&id, |cred| {
        if let Some(access_token) = body.access_token {
            cred.access_token = access_token;
        }
        if let Some(refresh_token) = body.refresh_token {
            cred.refresh_token = Some(refresh_token);
        }
        if let Some(region) = body.region {
            cred.region = region;
        }
        if let Some(profile_arn) = body.profile_arn {
            cred.profile_arn = Some(profile_arn);
        }
        if let Some(machine_id) = body.machine_id {
            cred.machine_id = Some(machine_id);
        }
        if let Some(subscription_tier) = body.subscription_tier {
            cred.subscription_tier = Some(subscription_tier);
        }
        if let Some(disabled) = body.disabled {
            cred.disabled = disabled;
        }
    });
    if !updated {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.engine.persist_credential(&id);
    Json(json!({"id": id})).into_response()
}

async fn accounts_delete(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !state.engine.pool.remove(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let storage = Arc::clone(&state.engine.storage);
    tokio::spawn(async move {
        let _ = storage.delete_credential(&id).await;
    });
    StatusCode::NO_CONTENT.into_response()
}

async fn accounts_refresh(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(cred) = state.engine.pool.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match refresh_credential(state.engine.upstream.http(), &cred).await {
        Ok(tokens) => {
            state.engine.pool.apply_refresh(
                &id,
                tokens.access_token,
                tokens.refresh_token,
                tokens.expires_at,
                tokens.subscription_tier,
                tokens.remaining_quota,
            );
            state.engine.persist_credential(&id);
            Json(json!({"ok": true})).into_response()
        }
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"ok": false, "error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn accounts_verify(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(cred) = state.engine.pool.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // A refresh round-trip proves the credential is alive without burning
    // inference quota.
    match refresh_credential(state.engine.upstream.http(), &cred).await {
        Ok(tokens) => {
            let tier = tokens.subscription_tier.clone();
            state.engine.pool.apply_refresh(
                &id,
                tokens.access_token,
                tokens.refresh_token,
                tokens.expires_at,
                tokens.subscription_tier,
                tokens.remaining_quota,
            );
            Json(json!({"valid": true, "subscription_tier": tier})).into_response()
        }
        Err(err) => {
            Json(json!({"valid": false, "error": err.to_string()})).into_response()
        }
    }
}

async fn accounts_usage(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state
        .engine
        .pool
        .diagnostics()
        .into_iter()
        .find(|status| status.id == id)
    {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn masked_credential(cred: &Credential) -> Value {
    json!({
        "id": cred.id,
        "region": cred.region,
        "profile_arn": cred.profile_arn,
        "machine_id": cred.machine_id,
        "subscription_tier": cred.subscription_tier,
        "disabled": cred.disabled,
        "has_refresh_token": cred.refresh_token.is_some(),
    })
}

// ---- Keys ----

#[derive(Debug, Deserialize)]
struct KeyBody {
    label: Option<String>,
    enabled: Option<bool>,
    allowed_models: Option<Vec<String>>,
    allowed_credentials: Option<Vec<String>>,
}

async fn keys_list(State(state): State<AppState>) -> Response {
    Json(state.engine.keys.list_masked()).into_response()
}

async fn keys_create(State(state): State<AppState>, Json(body): Json<KeyBody>) -> Response {
    let record = state
        .engine
        .keys
        .create(body.label, body.allowed_models, body.allowed_credentials);
    persist_key(&state, &record.id);
    // The raw key is returned exactly once.
    (
        StatusCode::CREATED,
        Json(json!({"id": record.id, "key": record.key})),
    )
        .into_response()
}

async fn keys_get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.keys.get(&id) {
        Some(record) => Json(record.masked()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn keys_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<KeyBody>,
) -> Response {
    let updated = state.engine.keys.update(&id, |record| {
        if body.label.is_some() {
            record.label = body.label.clone();
        }
        if let Some(enabled) = body.enabled {
            record.enabled = enabled;
        }
        if body.allowed_models.is_some() {
            record.allowed_models = body.allowed_models.clone();
        }
        if body.allowed_credentials.is_some() {
            record.allowed_credentials = body.allowed_credentials.clone();
        }
    });
    match updated {
        Some(record) => {
            persist_key(&state, &record.id);
            Json(record.masked()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn keys_delete(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !state.engine.keys.delete(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let storage = Arc::clone(&state.engine.storage);
    tokio::spawn(async move {
        let _ = storage.delete_api_key(&id).await;
    });
    StatusCode::NO_CONTENT.into_response()
}

fn persist_key(state: &AppState, id: &str) {
    let Some(record) = state.engine.keys.get(id) else {
        return;
    };
    let Ok(data) = serde_json::to_value(&record) else {
        return;
    };
    let storage = Arc::clone(&state.engine.storage);
    let id = id.to_string();
    tokio::spawn(async move {
        let _ = storage.upsert_api_key(&id, &data).await;
    });
}

// ---- Status / stats / settings ----

async fn proxy_status(State(state): State<AppState>) -> Response {
    let diagnostics = state.engine.pool.diagnostics();
    let available = diagnostics
        .iter()
        .filter(|status| !status.disabled && !status.quota_exhausted)
        .count();
    Json(json!({
        "status": "ok",
        "credentials": diagnostics.len(),
        "credentials_available": available,
        "breaker": breaker_state_name(state.engine.breaker.state()),
    }))
    .into_response()
}

async fn proxy_health(State(state): State<AppState>) -> Response {
    let healthy = !state.engine.pool.is_empty()
        && state.engine.breaker.state() != BreakerState::Open;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"healthy": healthy}))).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.engine.stats.snapshot()).into_response()
}

async fn proxy_stats(State(state): State<AppState>) -> Response {
    Json(json!({
        "totals": state.engine.stats.snapshot(),
        "credentials": state.engine.pool.diagnostics(),
    }))
    .into_response()
}

async fn proxy_logs(State(state): State<AppState>) -> Response {
    Json(state.engine.request_log.snapshot()).into_response()
}

async fn config_get(State(state): State<AppState>) -> Response {
    match state.engine.storage.load_setting(SETTING_PROXY).await {
        Ok(Some(value)) => Json(value).into_response(),
        Ok(None) => Json(json!({})).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn config_put(State(state): State<AppState>, Json(value): Json<Value>) -> Response {
    match state.engine.storage.put_setting(SETTING_PROXY, &value).await {
        Ok(()) => Json(value).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn settings_get(State(state): State<AppState>) -> Response {
    Json(
        serde_json::to_value(state.engine.settings.load_full().as_ref())
            .unwrap_or_else(|_| json!({})),
    )
    .into_response()
}

async fn settings_put(State(state): State<AppState>, Json(value): Json<Value>) -> Response {
    let settings: RuntimeSettings = match serde_json::from_value(value.clone()) {
        Ok(settings) => settings,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid settings: {err}")})),
            )
                .into_response();
        }
    };
    state.engine.pool.set_policy(settings.selection_policy);
    state.engine.settings.store(Arc::new(settings));
    let storage = Arc::clone(&state.engine.storage);
    tokio::spawn(async move {
        let _ = storage.put_setting(SETTING_SETTINGS, &value).await;
    });
    Json(json!({"ok": true})).into_response()
}

fn breaker_state_name(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    }
}
