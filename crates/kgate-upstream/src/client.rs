//! Upstream client: endpoint failover, the status retry ladder, and the
//! streaming decode pump.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use kgate_pool::Credential;
use kgate_protocol::upstream::ConversationPayload;
use kgate_transform::sanitize::{TruncationTier, aggressive_sanitize, truncate_history};
use kgate_transform::thinking::{ParsedSegment, ThinkingParser};
use kgate_transform::{StreamPiece, UsageTotals};

use crate::decoder::{EventFrame, FrameDecoder};
use crate::dns::DnsCache;
use crate::endpoints::{Endpoint, EndpointTable};
use crate::events::{
    AssistantResponseEvent, ContextUsageEvent, ExceptionEvent, MeteringEvent,
    ReasoningContentEvent, SupplementaryWebLinksEvent, ToolUseEvent, UpstreamError, merge_usage,
};
use crate::fingerprint::{agent_mode, machine_fingerprint};
use crate::toolbuf::{CONTENT_LENGTH_TOOL_ID, ToolBuffers, ToolEvent};

const CLIENT_VERSION: &str = "1.0.27";
const IDE_VERSION: &str = "0.8.0";
const MAX_TRANSPORT_ATTEMPTS: u32 = 3;
const RATE_LIMIT_SWITCH_SLEEP: Duration = Duration::from_secs(1);
const SERVER_ERROR_BACKOFF_BASE: Duration = Duration::from_millis(500);
const SERVER_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            stream_idle_timeout: Duration::from_secs(120),
        }
    }
}

/// One decoded upstream occurrence delivered to the request's consumer.
/// `Completed` and `Failed` are terminal and fire exactly once.
#[derive(Debug)]
pub enum UpstreamEvent {
    Piece(StreamPiece),
    Completed(UsageTotals),
    Failed(UpstreamError),
}

pub struct UpstreamClient {
    http: wreq::Client,
    endpoints: EndpointTable,
    dns: DnsCache,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = wreq::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| UpstreamError::Network(err.to_string()))?;
        Ok(Self {
            http,
            endpoints: EndpointTable::new(),
            dns: DnsCache::new(),
            config,
        })
    }

    pub fn http(&self) -> &wreq::Client {
        &self.http
    }

    /// Send one conversation turn. On success the returned channel yields
    /// stream pieces in upstream order, then exactly one `Completed`; any
    /// failure after this call resolves yields exactly one `Failed`.
    pub async fn send_conversation(
        &self,
        cred: &Credential,
        mut payload: ConversationPayload,
        thinking_enabled: bool,
        prefer_endpoint: Option<&str>,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError> {
        let order = self.endpoints.ordered(prefer_endpoint);
        let mut transport_attempts: u32 = 0;
        let mut endpoint_cursor: usize = 0;
        let mut truncation: Option<TruncationTier> = None;
        let mut aggressive_done = false;
        let mut last_error = UpstreamError::Network("no attempt made".to_string());

        loop {
            if transport_attempts >= MAX_TRANSPORT_ATTEMPTS {
                return Err(last_error);
            }
            let endpoint = &order[endpoint_cursor % order.len()];
            let host = endpoint.host(&cred.region);

            if let Err(err) = self.dns.resolve(&host).await {
                self.endpoints.record_failure(endpoint.name);
                transport_attempts += 1;
                endpoint_cursor += 1;
                last_error = UpstreamError::Dns(err.to_string());
                continue;
            }

            payload
                .conversation_state
                .current_message
                .user_input_message
                .origin = Some(endpoint.origin.to_string());

            let started = Instant::now();
            let request = self.build_request(endpoint, cred, &payload)?;
            info!(
                event = "upstream_request",
                endpoint = endpoint.name,
                credential_id = %cred.id,
                attempt = transport_attempts + 1
            );

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        event = "upstream_network_error",
                        endpoint = endpoint.name,
                        error = %err
                    );
                    self.endpoints.record_failure(endpoint.name);
                    transport_attempts += 1;
                    endpoint_cursor += 1;
                    last_error = UpstreamError::Network(err.to_string());
                    continue;
                }
            };

            let status = response.status().as_u16();
            info!(
                event = "upstream_response",
                endpoint = endpoint.name,
                status,
                elapsed_ms = started.elapsed().as_millis() as u64
            );

            match status {
                200..=299 => {
                    self.endpoints.record_success(endpoint.name, started.elapsed());
                    return Ok(self.spawn_pump(response, thinking_enabled));
                }
                429 => {
                    self.endpoints.record_failure(endpoint.name);
                    transport_attempts += 1;
                    endpoint_cursor += 1;
                    last_error = UpstreamError::RateLimited;
                    let wait = retry_after(&response)
                        .map(|d| d.min(RATE_LIMIT_SWITCH_SLEEP))
                        .unwrap_or(RATE_LIMIT_SWITCH_SLEEP);
                    tokio::time::sleep(wait).await;
                    continue;
                }
                402 => {
                    let body = read_body(response).await;
                    return Err(UpstreamError::QuotaExhausted { body });
                }
                401 | 403 => {
                    let body = read_body(response).await;
                    return Err(UpstreamError::Auth { status, body });
                }
                400 => {
                    let body = read_body(response).await;
                    if is_content_too_long(&body) {
                        let tier = match truncation {
                            None => TruncationTier::KeepHalf,
                            Some(prev) => match prev.next() {
                                Some(next) => next,
                                None => return Err(UpstreamError::ContentTooLong),
                            },
                        };
                        warn!(event = "history_truncation", tier = ?tier);
                        payload.conversation_state.history =
                            truncate_history(&payload.conversation_state.history, tier);
                        truncation = Some(tier);
                        continue;
                    }
                    if !aggressive_done {
                        aggressive_done = true;
                        warn!(event = "aggressive_sanitize");
                        let history = std::mem::take(&mut payload.conversation_state.history);
                        payload.conversation_state.history = aggressive_sanitize(history);
                        continue;
                    }
                    return Err(UpstreamError::Status { status, body });
                }
                500..=599 => {
                    self.endpoints.record_failure(endpoint.name);
                    let backoff = SERVER_ERROR_BACKOFF_BASE
                        .saturating_mul(2u32.saturating_pow(transport_attempts))
                        .min(SERVER_ERROR_BACKOFF_MAX);
                    // Small jitter so parallel retries do not stampede.
                    let jitter_ms = rand::rng().random_range(0..=backoff.as_millis() as u64 / 4);
                    let backoff = backoff + Duration::from_millis(jitter_ms);
                    transport_attempts += 1;
                    endpoint_cursor += 1;
                    last_error = UpstreamError::Status {
                        status,
                        body: read_body(response).await,
                    };
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                _ => {
                    let body = read_body(response).await;
                    return Err(UpstreamError::Status { status, body });
                }
            }
        }
    }

    fn build_request(
        &self,
        endpoint: &Endpoint,
        cred: &Credential,
        payload: &ConversationPayload,
    ) -> Result<wreq::RequestBuilder, UpstreamError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| UpstreamError::Decode(err.to_string()))?;
        let fingerprint =
            machine_fingerprint(cred.machine_id.as_deref(), cred.refresh_token.as_deref());
        let sdk_ua = format!("aws-sdk-js/{CLIENT_VERSION} KiroIDE-{IDE_VERSION}-{fingerprint}");
        let user_agent = format!(
            "aws-sdk-js/{CLIENT_VERSION} ua/2.1 os/linux lang/js md/nodejs#20.16.0 \
api/codewhispererstreaming#{CLIENT_VERSION} m/E KiroIDE-{IDE_VERSION}-{fingerprint}"
        );

        Ok(self
            .http
            .post(endpoint.url(&cred.region))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", cred.access_token))
            .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
            .header("amz-sdk-request", "attempt=1; max=3")
            .header("x-amzn-codewhisperer-optout", "true")
            .header(
                "x-amzn-kiro-agent-mode",
                agent_mode(cred.machine_id.as_deref()),
            )
            .header("x-amz-user-agent", sdk_ua)
            .header("user-agent", user_agent)
            .body(body))
    }

    fn spawn_pump(
        &self,
        response: wreq::Response,
        thinking_enabled: bool,
    ) -> mpsc::Receiver<UpstreamEvent> {
        let (tx, rx) = mpsc::channel::<UpstreamEvent>(64);
        let idle_timeout = self.config.stream_idle_timeout;

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut state = PumpState {
                decoder: FrameDecoder::new(),
                thinking: ThinkingParser::new(),
                tools: ToolBuffers::new(),
                usage: UsageTotals::default(),
                overflow_sent: false,
                thinking_enabled,
            };

            loop {
                let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                let chunk = match next {
                    Err(_) => {
                        let _ = tx.send(UpstreamEvent::Failed(UpstreamError::IdleTimeout)).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        let _ = tx
                            .send(UpstreamEvent::Failed(UpstreamError::Network(
                                err.to_string(),
                            )))
                            .await;
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                let frames = match state.decoder.push(&chunk) {
                    Ok(frames) => frames,
                    Err(err) => {
                        let _ = tx
                            .send(UpstreamEvent::Failed(UpstreamError::Decode(
                                err.to_string(),
                            )))
                            .await;
                        return;
                    }
                };
                for frame in frames {
                    match state.dispatch(frame) {
                        Ok(pieces) => {
                            for piece in pieces {
                                if tx.send(UpstreamEvent::Piece(piece)).await.is_err() {
                                    // Consumer is gone; dropping the response
                                    // aborts the upstream connection.
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(UpstreamEvent::Failed(err)).await;
                            return;
                        }
                    }
                }
            }

            // Normal end of stream: flush parser residue and unstopped tool
            // buffers, then complete exactly once.
            let mut tail: Vec<StreamPiece> = Vec::new();
            for segment in state.thinking.finish() {
                tail.push(segment_piece(segment, state.thinking_enabled));
            }
            for event in state.tools.flush() {
                tail.push(tool_piece(event));
            }
            for piece in tail {
                if tx.send(UpstreamEvent::Piece(piece)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(UpstreamEvent::Completed(state.usage)).await;
        });

        rx
    }
}

struct PumpState {
    decoder: FrameDecoder,
    thinking: ThinkingParser,
    tools: ToolBuffers,
    usage: UsageTotals,
    overflow_sent: bool,
    thinking_enabled: bool,
}

impl PumpState {
    fn dispatch(&mut self, frame: EventFrame) -> Result<Vec<StreamPiece>, UpstreamError> {
        let mut out = Vec::new();
        match frame.event_type.as_str() {
            "assistantResponseEvent" => {
                let event: AssistantResponseEvent =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                if let Some(content) = event.content {
                    for segment in self.thinking.push(&content) {
                        out.push(segment_piece(segment, self.thinking_enabled));
                    }
                }
            }
            "toolUseEvent" => {
                let event: ToolUseEvent =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                if event.tool_use_id == CONTENT_LENGTH_TOOL_ID {
                    self.push_overflow(&mut out);
                } else if !event.tool_use_id.is_empty() {
                    for tool_event in self.tools.on_event(
                        &event.tool_use_id,
                        event.name.as_deref(),
                        event.input.as_ref(),
                        event.stop.unwrap_or(false),
                    ) {
                        out.push(tool_piece(tool_event));
                    }
                }
            }
            "messageMetadataEvent" | "metadataEvent" => {
                merge_usage(&mut self.usage, &frame.payload);
            }
            "meteringEvent" => {
                let event: MeteringEvent =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                self.usage.credits += event.credits.unwrap_or(0.0);
            }
            "contextUsageEvent" => {
                let event: ContextUsageEvent =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                if event.percentage.unwrap_or(0.0) >= 100.0 {
                    self.push_overflow(&mut out);
                }
            }
            "reasoningContentEvent" => {
                if self.thinking_enabled {
                    let event: ReasoningContentEvent =
                        serde_json::from_value(frame.payload).unwrap_or_default();
                    if let Some(content) = event.content.filter(|c| !c.is_empty()) {
                        out.push(StreamPiece::Thinking(content));
                    }
                }
            }
            "supplementaryWebLinksEvent" => {
                let event: SupplementaryWebLinksEvent =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                if let Some(markdown) = event.to_markdown() {
                    out.push(StreamPiece::Text(markdown));
                }
            }
            "exceptionEvent" => {
                let event: ExceptionEvent =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                let kind = event.exception_type.unwrap_or_default();
                if kind.contains("ContentLengthExceeded") {
                    self.push_overflow(&mut out);
                } else {
                    return Err(UpstreamError::Exception {
                        kind,
                        message: event.message.unwrap_or_default(),
                    });
                }
            }
            _ => {}
        }
        Ok(out)
    }

    fn push_overflow(&mut self, out: &mut Vec<StreamPiece>) {
        if !self.overflow_sent {
            self.overflow_sent = true;
            out.push(StreamPiece::ContentLengthExceeded);
        }
    }
}

fn segment_piece(segment: ParsedSegment, thinking_enabled: bool) -> StreamPiece {
    match segment {
        ParsedSegment::Text(text) => StreamPiece::Text(text),
        ParsedSegment::Thinking(thinking) if thinking_enabled => StreamPiece::Thinking(thinking),
        // Thinking was not requested; tagged content degrades to text.
        ParsedSegment::Thinking(thinking) => StreamPiece::Text(thinking),
    }
}

fn tool_piece(event: ToolEvent) -> StreamPiece {
    match event {
        ToolEvent::Start { id, name } => StreamPiece::ToolUseStart { id, name },
        ToolEvent::Delta { id, fragment } => StreamPiece::ToolUseDelta { id, fragment },
        ToolEvent::Stop { id, input } => StreamPiece::ToolUseStop { id, input },
    }
}

async fn read_body(response: wreq::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => String::new(),
    }
}

fn retry_after(response: &wreq::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn is_content_too_long(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    lowered.contains("too long")
        || lowered.contains("content length")
        || lowered.contains("contentlengthexceeded")
        || lowered.contains("input is too large")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_phrasing_matches() {
        assert!(is_content_too_long("Input is too long for this model"));
        assert!(is_content_too_long(
            "{\"__type\":\"ContentLengthExceededException\"}"
        ));
        assert!(!is_content_too_long("validation error: bad tool schema"));
    }

    #[test]
    fn overflow_piece_emitted_once() {
        let mut state = PumpState {
            decoder: FrameDecoder::new(),
            thinking: ThinkingParser::new(),
            tools: ToolBuffers::new(),
            usage: UsageTotals::default(),
            overflow_sent: false,
            thinking_enabled: true,
        };
        let frame = EventFrame {
            event_type: "contextUsageEvent".to_string(),
            payload: serde_json::json!({"percentage": 120.0}),
        };
        let first = state.dispatch(frame.clone()).unwrap();
        assert_eq!(first, vec![StreamPiece::ContentLengthExceeded]);
        let second = state.dispatch(frame).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn synthetic_tool_id_maps_to_overflow() {
        let mut state = PumpState {
            decoder: FrameDecoder::new(),
            thinking: ThinkingParser::new(),
            tools: ToolBuffers::new(),
            usage: UsageTotals::default(),
            overflow_sent: false,
            thinking_enabled: false,
        };
        let frame = EventFrame {
            event_type: "toolUseEvent".to_string(),
            payload: serde_json::json!({
                "toolUseId": CONTENT_LENGTH_TOOL_ID,
                "name": "x",
                "stop": true
            }),
        };
        let out = state.dispatch(frame).unwrap();
        assert_eq!(out, vec![StreamPiece::ContentLengthExceeded]);
    }

    #[test]
    fn thinking_segments_degrade_without_thinking() {
        let piece = segment_piece(ParsedSegment::Thinking("t".to_string()), false);
        assert_eq!(piece, StreamPiece::Text("t".to_string()));
    }

    #[test]
    fn exception_event_fails_stream() {
        let mut state = PumpState {
            decoder: FrameDecoder::new(),
            thinking: ThinkingParser::new(),
            tools: ToolBuffers::new(),
            usage: UsageTotals::default(),
            overflow_sent: false,
            thinking_enabled: false,
        };
        let frame = EventFrame {
            event_type: "exceptionEvent".to_string(),
            payload: serde_json::json!({"__type": "ThrottledException", "message": "slow down"}),
        };
        assert!(state.dispatch(frame).is_err());
    }

    #[test]
    fn metadata_accumulates_usage() {
        let mut state = PumpState {
            decoder: FrameDecoder::new(),
            thinking: ThinkingParser::new(),
            tools: ToolBuffers::new(),
            usage: UsageTotals::default(),
            overflow_sent: false,
            thinking_enabled: false,
        };
        state
            .dispatch(EventFrame {
                event_type: "metadataEvent".to_string(),
                payload: serde_json::json!({"uncachedInputTokens": 10, "outputTokens": 5}),
            })
            .unwrap();
        state
            .dispatch(EventFrame {
                event_type: "meteringEvent".to_string(),
                payload: serde_json::json!({"credits": 1.5}),
            })
            .unwrap();
        assert_eq!(state.usage.input_tokens, 10);
        assert_eq!(state.usage.output_tokens, 5);
        assert!((state.usage.credits - 1.5).abs() < f64::EPSILON);
    }
}
