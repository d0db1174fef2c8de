//! SSE frame encoding for both downstream dialects.

use bytes::Bytes;
use serde::Serialize;

use crate::anthropic::StreamEvent;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
pub const KEEPALIVE_FRAME: &[u8] = b": keep-alive\n\n";

/// `data: {json}\n\n` (OpenAI dialect).
pub fn data_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}

/// `event: <name>\ndata: {json}\n\n` (Anthropic dialect).
pub fn named_event_frame(event: &StreamEvent) -> Option<Bytes> {
    let payload = serde_json::to_vec(event).ok()?;
    let name = event.event_name();
    let mut data = Vec::with_capacity(payload.len() + name.len() + 16);
    data.extend_from_slice(b"event: ");
    data.extend_from_slice(name.as_bytes());
    data.extend_from_slice(b"\ndata: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_shape() {
        let frame = data_frame(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(&frame[..], b"data: {\"a\":1}\n\n");
    }

    #[test]
    fn named_event_carries_event_line() {
        let frame = named_event_frame(&StreamEvent::Ping).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: ping\n"));
        assert!(text.ends_with("\n\n"));
    }
}
