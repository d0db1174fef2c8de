//! Request orchestration: auth → limits → breaker → compression →
//! translation → credential scheduling → upstream streaming → re-encoding.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use kgate_compress::{Compressor, SummaryBackend, SummaryError, TurnRole, TurnView};
use kgate_pool::{AcquireRequest, Credential, CredentialLease, CredentialPool, ErrorKind};
use kgate_protocol::anthropic::MessagesRequest;
use kgate_protocol::openai::{ChatCompletionRequest, ModelEntry, ModelList};
use kgate_protocol::upstream::{
    CHAT_TRIGGER_MANUAL, ConversationPayload, ConversationState, CurrentMessage, HistoryEntry,
    InferenceConfig, UserInputMessage,
};
use kgate_storage::Storage;
use kgate_transform::payload::{PayloadOptions, assemble};
use kgate_transform::response::ResponseCollector;
use kgate_transform::session::SessionMap;
use kgate_transform::stream::{AnthropicSseEncoder, OpenAiSseEncoder, StreamClose};
use kgate_transform::tokens::estimate_tokens;
use kgate_transform::tools::ToolSpecCache;
use kgate_transform::{StreamPiece, UsageTotals, anthropic, openai, thinking};
use kgate_upstream::refresh::refresh_credential;
use kgate_upstream::{UpstreamClient, UpstreamError, UpstreamEvent};

use crate::breaker::CircuitBreaker;
use crate::classify::{ErrorCategory, classify_upstream, pool_error_kind};
use crate::error::EngineError;
use crate::keys::ApiKeyStore;
use crate::limiter::RateLimiter;
use crate::metrics::{ProxyStats, RequestLog, RequestLogEntry};
use crate::models::{ModelSpec, resolve_model};
use crate::settings::RuntimeSettings;

const REFRESH_WINDOW: time::Duration = time::Duration::minutes(5);
const SSE_PING_INTERVAL: Duration = Duration::from_secs(25);
const SSE_TOTAL_INACTIVITY: Duration = Duration::from_secs(300);
const ADHOC_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiDialect {
    OpenAi,
    Anthropic,
}

impl ApiDialect {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiDialect::OpenAi => "openai",
            ApiDialect::Anthropic => "anthropic",
        }
    }

    fn path(self) -> &'static str {
        match self {
            ApiDialect::OpenAi => "/v1/chat/completions",
            ApiDialect::Anthropic => "/v1/messages",
        }
    }
}

pub enum EngineResponse {
    Json(Value),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct Engine {
    pub pool: Arc<CredentialPool>,
    pub upstream: Arc<UpstreamClient>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub compressor: Option<Arc<Compressor>>,
    pub stats: Arc<ProxyStats>,
    pub request_log: Arc<RequestLog>,
    pub keys: Arc<ApiKeyStore>,
    pub storage: Arc<dyn Storage>,
    pub settings: ArcSwap<RuntimeSettings>,
    sessions: SessionMap,
    tool_cache: ToolSpecCache,
}

struct Prepared {
    dialect: ApiDialect,
    model: &'static ModelSpec,
    requested_model: String,
    payload: ConversationPayload,
    thinking_enabled: bool,
    stream: bool,
    allowed_credentials: Option<HashSet<String>>,
    requires_opus: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<CredentialPool>,
        upstream: Arc<UpstreamClient>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        compressor: Option<Arc<Compressor>>,
        stats: Arc<ProxyStats>,
        request_log: Arc<RequestLog>,
        keys: Arc<ApiKeyStore>,
        storage: Arc<dyn Storage>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            pool,
            upstream,
            breaker,
            limiter,
            compressor,
            stats,
            request_log,
            keys,
            storage,
            settings: ArcSwap::from_pointee(settings),
            sessions: SessionMap::new(),
            tool_cache: ToolSpecCache::new(),
        }
    }

    pub fn model_list(&self) -> ModelList {
        let created = OffsetDateTime::now_utc().unix_timestamp();
        ModelList {
            object: "list".to_string(),
            data: crate::models::MODELS
                .iter()
                .map(|spec| ModelEntry {
                    id: spec.public_id.to_string(),
                    object: "model".to_string(),
                    created,
                    owned_by: "kgate".to_string(),
                })
                .collect(),
        }
    }

    pub async fn chat_completions(
        &self,
        auth: crate::auth::AuthContext,
        request: ChatCompletionRequest,
    ) -> Result<EngineResponse, EngineError> {
        let started = Instant::now();
        let requested_model = request.model.clone();
        let result = self.chat_completions_inner(auth, request).await;
        self.log_failure_if_any(&result, ApiDialect::OpenAi, &requested_model, started);
        result
    }

    pub async fn messages(
        &self,
        auth: crate::auth::AuthContext,
        request: MessagesRequest,
    ) -> Result<EngineResponse, EngineError> {
        let started = Instant::now();
        let requested_model = request.model.clone();
        let result = self.messages_inner(auth, request).await;
        self.log_failure_if_any(&result, ApiDialect::Anthropic, &requested_model, started);
        result
    }

    async fn chat_completions_inner(
        &self,
        auth: crate::auth::AuthContext,
        request: ChatCompletionRequest,
    ) -> Result<EngineResponse, EngineError> {
        let settings = self.settings.load_full();
        let model = self.resolve_checked(&auth, &request.model)?;
        self.bump_key(&auth);

        let directive = thinking::detect_openai(&request, settings.thinking_override);
        let mut parts = openai::request_parts(&request);
        let conversation_id = self
            .sessions
            .conversation_for(openai::session_id(&request));
        parts.entries = self
            .maybe_compress(&conversation_id, parts.entries, settings.compress_keep_count)
            .await;
        let inference = InferenceConfig {
            max_tokens: request.max_completion_tokens.or(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
        };
        let payload = assemble(
            parts,
            &PayloadOptions {
                conversation_id,
                model_id: model.upstream_id.to_string(),
                origin: "AI_EDITOR".to_string(),
                profile_arn: None,
                thinking: directive.as_ref(),
                inference: Some(inference),
                now: OffsetDateTime::now_utc(),
                tool_cache: &self.tool_cache,
            },
        );

        let prepared = Prepared {
            dialect: ApiDialect::OpenAi,
            model,
            requested_model: request.model.clone(),
            payload,
            thinking_enabled: directive.is_some(),
            stream: request.stream.unwrap_or(false),
            allowed_credentials: self.adhoc_allowlist(&auth).await?,
            requires_opus: model.opus_class,
        };
        self.run(prepared).await
    }

    async fn messages_inner(
        &self,
        auth: crate::auth::AuthContext,
        request: MessagesRequest,
    ) -> Result<EngineResponse, EngineError> {
        let settings = self.settings.load_full();
        let model = self.resolve_checked(&auth, &request.model)?;
        self.bump_key(&auth);

        let directive = thinking::detect_anthropic(&request, settings.thinking_override);
        let mut parts = anthropic::request_parts(&request);
        let conversation_id = self
            .sessions
            .conversation_for(anthropic::session_id(&request));
        parts.entries = self
            .maybe_compress(&conversation_id, parts.entries, settings.compress_keep_count)
            .await;

        let inference = InferenceConfig {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        };
        let payload = assemble(
            parts,
            &PayloadOptions {
                conversation_id,
                model_id: model.upstream_id.to_string(),
                origin: "AI_EDITOR".to_string(),
                profile_arn: None,
                thinking: directive.as_ref(),
                inference: Some(inference),
                now: OffsetDateTime::now_utc(),
                tool_cache: &self.tool_cache,
            },
        );

        let prepared = Prepared {
            dialect: ApiDialect::Anthropic,
            model,
            requested_model: request.model.clone(),
            payload,
            thinking_enabled: directive.is_some(),
            stream: request.stream.unwrap_or(false),
            allowed_credentials: self.adhoc_allowlist(&auth).await?,
            requires_opus: model.opus_class,
        };
        self.run(prepared).await
    }

    fn resolve_checked(
        &self,
        auth: &crate::auth::AuthContext,
        model: &str,
    ) -> Result<&'static ModelSpec, EngineError> {
        let spec = resolve_model(model)
            .ok_or_else(|| EngineError::InvalidRequest(format!("unknown model: {model}")))?;
        if !auth.allows_model(spec.public_id) {
            return Err(EngineError::Auth(format!(
                "model {} not allowed for this key",
                spec.public_id
            )));
        }
        Ok(spec)
    }

    fn bump_key(&self, auth: &crate::auth::AuthContext) {
        if let crate::auth::AuthContext::ApiKey { key_id, .. } = auth {
            self.keys.bump(key_id);
        }
    }

    /// `key:refreshToken` callers pin the request to a synthetic credential
    /// materialized for that refresh token.
    async fn adhoc_allowlist(
        &self,
        auth: &crate::auth::AuthContext,
    ) -> Result<Option<HashSet<String>>, EngineError> {
        match auth {
            crate::auth::AuthContext::AdHoc { refresh_token } => {
                let id = match self.pool.find_by_refresh_token(refresh_token) {
                    Some(id) => id,
                    None => {
                        let id = format!("adhoc-{}", &Uuid::new_v4().simple().to_string()[..12]);
                        self.pool.add(Credential {
                            id: id.clone(),
                            access_token: String::new(),
                            refresh_token: Some(refresh_token.clone()),
                            region: ADHOC_REGION.to_string(),
                            profile_arn: None,
                            machine_id: None,
                            subscription_tier: None,
                            expires_at: None,
                            disabled: false,
                        });
                        self.pool.mark_needs_refresh(&id);
                        info!(event = "adhoc_credential_created", credential_id = %id);
                        id
                    }
                };
                Ok(Some(HashSet::from([id])))
            }
            _ => Ok(auth.allowed_credentials()),
        }
    }

    async fn maybe_compress(
        &self,
        conversation_id: &str,
        entries: Vec<HistoryEntry>,
        keep_count: usize,
    ) -> Vec<HistoryEntry> {
        let Some(compressor) = &self.compressor else {
            return entries;
        };
        let settings = self.settings.load_full();
        if !settings.compression_enabled || !settings.auto_compress {
            return entries;
        }
        let turns = entries_to_turns(&entries);
        let estimated: u64 = entries.iter().map(|e| estimate_tokens(e.text())).sum();
        if !compressor.should_compress(&turns, estimated) {
            return entries;
        }
        let compressed = compressor
            .compress(conversation_id, Some(keep_count), turns)
            .await;
        apply_compression(entries, compressed)
    }

    async fn run(&self, prepared: Prepared) -> Result<EngineResponse, EngineError> {
        let (allowed, reason) = self.limiter.check_global();
        if !allowed {
            return Err(EngineError::RateLimited(
                reason.unwrap_or("rate limited").to_string(),
            ));
        }
        if !self.breaker.can_execute() {
            return Err(EngineError::Overloaded);
        }

        let started = Instant::now();
        let (lease, events) = self.dispatch(&prepared).await?;
        if prepared.stream {
            Ok(EngineResponse::Stream(self.spawn_stream(
                prepared, lease, events, started,
            )))
        } else {
            self.collect(prepared, lease, events, started).await
        }
    }

    /// Acquire a credential and send; on retryable upstream errors rotate to
    /// the next credential within the attempt budget.
    async fn dispatch(
        &self,
        prepared: &Prepared,
    ) -> Result<(CredentialLease, mpsc::Receiver<UpstreamEvent>), EngineError> {
        let acquire = AcquireRequest {
            requires_opus: prepared.requires_opus,
            allowed_ids: prepared.allowed_credentials.clone(),
        };
        let settings = self.settings.load_full();
        let prefer = settings.preferred_endpoint.as_deref();
        let max_attempts = self.pool.len().clamp(1, 3);
        let mut last: Option<EngineError> = None;

        for _ in 0..max_attempts {
            let Some(lease) = self.pool.acquire(&acquire) else {
                return Err(last.unwrap_or_else(|| {
                    EngineError::RateLimited("no credentials available".to_string())
                }));
            };
            let mut cred = lease.credential.clone();

            let (allowed, reason) = self.limiter.check_credential(&cred.id);
            if !allowed {
                return Err(EngineError::RateLimited(
                    reason.unwrap_or("rate limited").to_string(),
                ));
            }

            if self.pool.needs_refresh(&cred.id)
                || cred.expires_within(REFRESH_WINDOW, OffsetDateTime::now_utc())
                || cred.access_token.is_empty()
            {
                match refresh_credential(self.upstream.http(), &cred).await {
                    Ok(tokens) => {
                        self.pool.apply_refresh(
                            &cred.id,
                            tokens.access_token.clone(),
                            tokens.refresh_token.clone(),
                            tokens.expires_at,
                            tokens.subscription_tier.clone(),
                            tokens.remaining_quota,
                        );
                        cred.access_token = tokens.access_token;
                        if let Some(refresh_token) = tokens.refresh_token {
                            cred.refresh_token = Some(refresh_token);
                        }
                        self.persist_credential(&cred.id);
                    }
                    Err(err) => {
                        warn!(
                            event = "refresh_failed",
                            credential_id = %cred.id,
                            error = %err
                        );
                        self.pool.record_error(&cred.id, ErrorKind::Auth);
                        last = Some(engine_error(&err));
                        continue;
                    }
                }
            }

            match self
                .upstream
                .send_conversation(
                    &cred,
                    prepared.payload.clone(),
                    prepared.thinking_enabled,
                    prefer,
                )
                .await
            {
                Ok(events) => {
                    self.breaker.record_success();
                    return Ok((lease, events));
                }
                Err(err) => {
                    let classified = classify_upstream(&err);
                    self.pool
                        .record_error(&cred.id, pool_error_kind(&classified));
                    if matches!(
                        classified.category,
                        ErrorCategory::Server | ErrorCategory::Network
                    ) {
                        self.breaker.record_failure();
                    }
                    if classified.refresh_token {
                        self.pool.mark_needs_refresh(&cred.id);
                    }
                    if matches!(
                        classified.category,
                        ErrorCategory::Quota | ErrorCategory::Banned
                    ) {
                        self.persist_credential(&cred.id);
                    }
                    if !classified.retryable {
                        return Err(engine_error(&err));
                    }
                    last = Some(engine_error(&err));
                    if classified.suggested_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(classified.suggested_delay_ms))
                            .await;
                    }
                }
            }
        }

        Err(last.unwrap_or_else(|| EngineError::RateLimited("no usable credentials".to_string())))
    }

    async fn collect(
        &self,
        prepared: Prepared,
        lease: CredentialLease,
        mut events: mpsc::Receiver<UpstreamEvent>,
        started: Instant,
    ) -> Result<EngineResponse, EngineError> {
        let credential_id = lease.credential.id.clone();
        let mut collector = ResponseCollector::new();
        let usage = loop {
            match events.recv().await {
                Some(UpstreamEvent::Piece(piece)) => collector.push(piece),
                Some(UpstreamEvent::Completed(usage)) => break usage,
                Some(UpstreamEvent::Failed(err)) => {
                    let classified = classify_upstream(&err);
                    self.pool
                        .record_error(&credential_id, pool_error_kind(&classified));
                    drop(lease);
                    return Err(engine_error(&err));
                }
                None => {
                    self.pool.record_error(&credential_id, ErrorKind::Network);
                    drop(lease);
                    return Err(EngineError::Upstream(
                        "upstream stream closed unexpectedly".to_string(),
                    ));
                }
            }
        };
        collector.set_usage(usage);

        let total_tokens = usage.total_input() + usage.output_tokens;
        self.pool
            .record_success(&credential_id, total_tokens, started.elapsed());
        self.stats.record(
            prepared.model.public_id,
            usage.total_input(),
            usage.output_tokens,
            true,
        );
        self.push_log(
            prepared.dialect,
            &prepared.requested_model,
            200,
            started.elapsed(),
            Some(credential_id.clone()),
            total_tokens,
            None,
        );
        drop(lease);

        let value = match prepared.dialect {
            ApiDialect::OpenAi => {
                let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
                let created = OffsetDateTime::now_utc().unix_timestamp();
                serde_json::to_value(collector.into_openai(
                    id,
                    prepared.requested_model.clone(),
                    created,
                ))
            }
            ApiDialect::Anthropic => {
                let id = format!("msg_{}", Uuid::new_v4().simple());
                serde_json::to_value(
                    collector.into_anthropic(id, prepared.requested_model.clone()),
                )
            }
        }
        .map_err(|err| EngineError::Upstream(err.to_string()))?;
        Ok(EngineResponse::Json(value))
    }

    fn spawn_stream(
        &self,
        prepared: Prepared,
        lease: CredentialLease,
        mut events: mpsc::Receiver<UpstreamEvent>,
        started: Instant,
    ) -> mpsc::Receiver<Bytes> {
        let (tx, out) = mpsc::channel::<Bytes>(32);
        let pool = Arc::clone(&self.pool);
        let stats = Arc::clone(&self.stats);
        let request_log = Arc::clone(&self.request_log);

        let mut encoder = match prepared.dialect {
            ApiDialect::OpenAi => StreamEncoder::OpenAi(OpenAiSseEncoder::new(
                format!("chatcmpl-{}", Uuid::new_v4().simple()),
                prepared.requested_model.clone(),
                OffsetDateTime::now_utc().unix_timestamp(),
            )),
            ApiDialect::Anthropic => StreamEncoder::Anthropic(AnthropicSseEncoder::new(
                format!("msg_{}", Uuid::new_v4().simple()),
                prepared.requested_model.clone(),
            )),
        };

        tokio::spawn(async move {
            let credential_id = lease.credential.id.clone();
            let mut ping = tokio::time::interval(SSE_PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping.tick().await;
            let mut last_activity = Instant::now();
            let mut usage = UsageTotals::default();
            let mut outcome: Option<Option<String>> = None;

            loop {
                tokio::select! {
                    maybe = events.recv() => {
                        last_activity = Instant::now();
                        match maybe {
                            Some(UpstreamEvent::Piece(piece)) => {
                                for frame in encoder.push(piece) {
                                    if tx.send(frame).await.is_err() {
                                        // Client went away: stop consuming;
                                        // dropping `events` cancels upstream.
                                        return;
                                    }
                                }
                            }
                            Some(UpstreamEvent::Completed(totals)) => {
                                usage = totals;
                                for frame in encoder.finish(StreamClose { usage }) {
                                    if tx.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                outcome = Some(None);
                                break;
                            }
                            Some(UpstreamEvent::Failed(err)) => {
                                let classified = classify_upstream(&err);
                                pool.record_error(&credential_id, pool_error_kind(&classified));
                                for frame in encoder.fail("api_error", &err.to_string()) {
                                    if tx.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                outcome = Some(Some(err.to_string()));
                                break;
                            }
                            None => {
                                pool.record_error(&credential_id, ErrorKind::Network);
                                for frame in encoder.fail("api_error", "upstream stream closed unexpectedly") {
                                    if tx.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                outcome = Some(Some("stream closed".to_string()));
                                break;
                            }
                        }
                    }
                    _ = ping.tick() => {
                        if last_activity.elapsed() >= SSE_TOTAL_INACTIVITY {
                            for frame in encoder.fail("api_error", "stream inactivity timeout") {
                                if tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            outcome = Some(Some("inactivity timeout".to_string()));
                            break;
                        }
                        for frame in encoder.ping() {
                            if tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            let error = outcome.flatten();
            let success = error.is_none();
            let total_tokens = usage.total_input() + usage.output_tokens;
            if success {
                pool.record_success(&credential_id, total_tokens, started.elapsed());
            }
            stats.record(
                prepared.model.public_id,
                usage.total_input(),
                usage.output_tokens,
                success,
            );
            request_log.push(RequestLogEntry {
                timestamp: OffsetDateTime::now_utc(),
                method: "POST".to_string(),
                path: prepared.dialect.path().to_string(),
                status_code: 200,
                duration_ms: started.elapsed().as_millis() as u64,
                model: prepared.requested_model.clone(),
                api_dialect: prepared.dialect.as_str().to_string(),
                credential_id: Some(credential_id),
                token_count: total_tokens,
                error_kind: error,
            });
        });

        out
    }

    fn log_failure_if_any(
        &self,
        result: &Result<EngineResponse, EngineError>,
        dialect: ApiDialect,
        model: &str,
        started: Instant,
    ) {
        if let Err(err) = result {
            self.stats.record(model, 0, 0, false);
            self.push_log(
                dialect,
                model,
                err.status(dialect),
                started.elapsed(),
                None,
                0,
                Some(err.error_type(dialect).to_string()),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_log(
        &self,
        dialect: ApiDialect,
        model: &str,
        status_code: u16,
        elapsed: Duration,
        credential_id: Option<String>,
        token_count: u64,
        error_kind: Option<String>,
    ) {
        self.request_log.push(RequestLogEntry {
            timestamp: OffsetDateTime::now_utc(),
            method: "POST".to_string(),
            path: dialect.path().to_string(),
            status_code,
            duration_ms: elapsed.as_millis() as u64,
            model: model.to_string(),
            api_dialect: dialect.as_str().to_string(),
            credential_id,
            token_count,
            error_kind,
        });
    }

    /// Fire-and-forget persistence of a credential's current state.
    pub fn persist_credential(&self, id: &str) {
        let Some(cred) = self.pool.get(id) else {
            return;
        };
        let flags = self
            .pool
            .diagnostics()
            .into_iter()
            .find(|status| status.id == id);
        let mut data = match serde_json::to_value(&cred) {
            Ok(value) => value,
            Err(_) => return,
        };
        if let (Some(object), Some(flags)) = (data.as_object_mut(), flags) {
            object.insert("quota_exhausted".to_string(), flags.quota_exhausted.into());
        }
        let storage = Arc::clone(&self.storage);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(err) = storage.upsert_credential(&id, &data).await {
                warn!(event = "credential_persist_failed", credential_id = %id, error = %err);
            }
        });
    }
}

enum StreamEncoder {
    OpenAi(OpenAiSseEncoder),
    Anthropic(AnthropicSseEncoder),
}

impl StreamEncoder {
    fn push(&mut self, piece: StreamPiece) -> Vec<Bytes> {
        match self {
            StreamEncoder::OpenAi(encoder) => encoder.push(piece),
            StreamEncoder::Anthropic(encoder) => encoder.push(piece),
        }
    }

    fn finish(&mut self, close: StreamClose) -> Vec<Bytes> {
        match self {
            StreamEncoder::OpenAi(encoder) => encoder.finish(close),
            StreamEncoder::Anthropic(encoder) => encoder.finish(close),
        }
    }

    fn fail(&mut self, kind: &str, message: &str) -> Vec<Bytes> {
        match self {
            StreamEncoder::OpenAi(encoder) => encoder.fail(kind, message),
            StreamEncoder::Anthropic(encoder) => encoder.fail(kind, message),
        }
    }

    fn ping(&mut self) -> Vec<Bytes> {
        match self {
            StreamEncoder::OpenAi(encoder) => encoder.ping(),
            StreamEncoder::Anthropic(encoder) => encoder.ping(),
        }
    }
}

fn engine_error(err: &UpstreamError) -> EngineError {
    match err {
        UpstreamError::QuotaExhausted { .. } => {
            EngineError::RateLimited("upstream quota exhausted".to_string())
        }
        UpstreamError::RateLimited => {
            EngineError::RateLimited("upstream rate limited".to_string())
        }
        UpstreamError::ContentTooLong => {
            EngineError::InvalidRequest("conversation is too long for the upstream".to_string())
        }
        UpstreamError::Status { status, body } if (400..500).contains(status) => {
            EngineError::InvalidRequest(format!(
                "upstream rejected request: {}",
                kgate_upstream::events::enhance_error_body(body)
            ))
        }
        other => EngineError::Upstream(other.to_string()),
    }
}

fn entries_to_turns(entries: &[HistoryEntry]) -> Vec<TurnView> {
    entries
        .iter()
        .map(|entry| match entry {
            HistoryEntry::User { user_input_message } => TurnView {
                role: TurnRole::User,
                text: user_input_message.content.clone(),
                has_tool_use: false,
                has_tool_result: user_input_message
                    .user_input_message_context
                    .as_ref()
                    .and_then(|ctx| ctx.tool_results.as_ref())
                    .is_some_and(|results| !results.is_empty()),
            },
            HistoryEntry::Assistant {
                assistant_response_message,
            } => TurnView {
                role: TurnRole::Assistant,
                text: assistant_response_message.content.clone(),
                has_tool_use: assistant_response_message
                    .tool_uses
                    .as_ref()
                    .is_some_and(|uses| !uses.is_empty()),
                has_tool_result: false,
            },
        })
        .collect()
}

/// Map the compressor's turn list back onto real history entries. Synthetic
/// summary heads become plain text turns; the preserved tail keeps its
/// original structure (tool uses, images, results).
fn apply_compression(original: Vec<HistoryEntry>, compressed: Vec<TurnView>) -> Vec<HistoryEntry> {
    if compressed.len() == original.len() {
        return original;
    }
    let synthetic_heads = if compressed
        .first()
        .is_some_and(|turn| turn.text.starts_with(kgate_compress::SUMMARY_PREFIX))
    {
        2.min(compressed.len())
    } else {
        0
    };
    let preserved = compressed.len() - synthetic_heads;
    let tail_start = original.len().saturating_sub(preserved);

    let mut out: Vec<HistoryEntry> = Vec::with_capacity(compressed.len());
    for head in compressed.iter().take(synthetic_heads) {
        out.push(match head.role {
            TurnRole::User => HistoryEntry::user(head.text.clone()),
            TurnRole::Assistant => HistoryEntry::assistant(head.text.clone()),
        });
    }
    out.extend(original.into_iter().skip(tail_start));
    out
}

/// Batch summaries run through the same upstream as live traffic.
pub struct UpstreamSummaryBackend {
    pub pool: Arc<CredentialPool>,
    pub upstream: Arc<UpstreamClient>,
}

#[async_trait]
impl SummaryBackend for UpstreamSummaryBackend {
    async fn summarize(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, SummaryError> {
        let spec = resolve_model(model)
            .ok_or_else(|| SummaryError(format!("unknown summary model: {model}")))?;
        let lease = self
            .pool
            .acquire(&AcquireRequest::default())
            .ok_or_else(|| SummaryError("no credentials for summarization".to_string()))?;

        let mut message = UserInputMessage::text(prompt);
        message.model_id = Some(spec.upstream_id.to_string());
        message.inference_config = Some(InferenceConfig {
            max_tokens: Some(max_tokens),
            temperature: None,
            top_p: None,
        });
        let payload = ConversationPayload {
            conversation_state: ConversationState {
                chat_trigger_type: CHAT_TRIGGER_MANUAL.to_string(),
                conversation_id: Uuid::new_v4().to_string(),
                current_message: CurrentMessage {
                    user_input_message: message,
                },
                history: Vec::new(),
            },
            profile_arn: lease.credential.profile_arn.clone(),
        };

        let mut events = self
            .upstream
            .send_conversation(&lease.credential, payload, false, None)
            .await
            .map_err(|err| SummaryError(err.to_string()))?;

        let mut text = String::new();
        loop {
            match events.recv().await {
                Some(UpstreamEvent::Piece(StreamPiece::Text(chunk))) => text.push_str(&chunk),
                Some(UpstreamEvent::Piece(_)) => {}
                Some(UpstreamEvent::Completed(_)) => break,
                Some(UpstreamEvent::Failed(err)) => {
                    return Err(SummaryError(err.to_string()));
                }
                None => break,
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_protocol::upstream::{
        AssistantResponseMessage, AssistantToolUse, ToolResult, ToolResultContent,
        UserInputMessageContext,
    };

    fn tool_pair() -> Vec<HistoryEntry> {
        vec![
            HistoryEntry::user("go"),
            HistoryEntry::Assistant {
                assistant_response_message: AssistantResponseMessage {
                    content: "calling".to_string(),
                    tool_uses: Some(vec![AssistantToolUse {
                        tool_use_id: "u1".to_string(),
                        name: "t".to_string(),
                        input: serde_json::json!({}),
                    }]),
                },
            },
            HistoryEntry::User {
                user_input_message: UserInputMessage {
                    content: "done".to_string(),
                    model_id: None,
                    origin: None,
                    images: None,
                    inference_config: None,
                    user_input_message_context: Some(UserInputMessageContext {
                        tool_results: Some(vec![ToolResult {
                            tool_use_id: "u1".to_string(),
                            status: "success".to_string(),
                            content: vec![ToolResultContent::text("ok")],
                        }]),
                        tools: None,
                    }),
                },
            },
        ]
    }

    #[test]
    fn turn_views_carry_tool_flags() {
        let turns = entries_to_turns(&tool_pair());
        assert!(!turns[0].has_tool_use);
        assert!(turns[1].has_tool_use);
        assert!(turns[2].has_tool_result);
    }

    #[test]
    fn compression_mapping_preserves_tail_structure() {
        let mut original = Vec::new();
        for i in 0..10 {
            original.push(HistoryEntry::user(format!("q{i}")));
            original.push(HistoryEntry::assistant(format!("a{i}")));
        }
        original.extend(tool_pair());

        // Simulated compressor output: summary head plus last 5 turns.
        let mut compressed = vec![
            TurnView::user(format!("{}\nsummary", kgate_compress::SUMMARY_PREFIX)),
            TurnView::assistant(kgate_compress::SUMMARY_ACK),
        ];
        compressed.extend(entries_to_turns(&original[original.len() - 5..]));

        let rebuilt = apply_compression(original.clone(), compressed);
        assert_eq!(rebuilt.len(), 7);
        assert!(rebuilt[0].text().starts_with(kgate_compress::SUMMARY_PREFIX));
        // The tool pair survives with full structure.
        match &rebuilt[rebuilt.len() - 2] {
            HistoryEntry::Assistant {
                assistant_response_message,
            } => assert!(assistant_response_message.tool_uses.is_some()),
            _ => panic!("expected assistant"),
        }
    }

    #[test]
    fn unchanged_compression_returns_original() {
        let original = tool_pair();
        let turns = entries_to_turns(&original);
        let rebuilt = apply_compression(original.clone(), turns);
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn upstream_errors_map_to_engine_errors() {
        assert!(matches!(
            engine_error(&UpstreamError::QuotaExhausted {
                body: String::new()
            }),
            EngineError::RateLimited(_)
        ));
        assert!(matches!(
            engine_error(&UpstreamError::ContentTooLong),
            EngineError::InvalidRequest(_)
        ));
        assert!(matches!(
            engine_error(&UpstreamError::Status {
                status: 400,
                body: "bad".to_string()
            }),
            EngineError::InvalidRequest(_)
        ));
        assert!(matches!(
            engine_error(&UpstreamError::Network("boom".to_string())),
            EngineError::Upstream(_)
        ));
    }
}
