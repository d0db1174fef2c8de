//! Binary event-stream frame decoder.
//!
//! Wire format per frame:
//! `[u32 total BE][u32 headers_len BE][headers][payload][u32 crc BE]`
//! where `crc` covers every preceding byte of the frame. Headers are typed
//! fields; the `:event-type` string header names the JSON payload.
//!
//! Corruption recovery drops one byte at a time and retries; five
//! consecutive resyncs fail the stream.

use bytes::{Buf, BytesMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use serde_json::Value;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const MIN_FRAME_LEN: usize = 16;
const PRELUDE_LEN: usize = 8;
const CRC_LEN: usize = 4;
const MAX_CONSECUTIVE_RESYNCS: u32 = 5;

const EVENT_TYPE_HEADER: &str = ":event-type";
const HEADER_TYPE_STRING: u8 = 7;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("stream corrupt: {0} consecutive resyncs")]
    TooManyResyncs(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    consecutive_resyncs: u32,
    pub error_count: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<EventFrame>, FrameDecodeError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < PRELUDE_LEN {
                break;
            }
            let total = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            let headers_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total)
                || headers_len > total - PRELUDE_LEN - CRC_LEN
            {
                self.resync()?;
                continue;
            }
            if self.buf.len() < total {
                break;
            }

            let expected =
                u32::from_be_bytes([
                    self.buf[total - 4],
                    self.buf[total - 3],
                    self.buf[total - 2],
                    self.buf[total - 1],
                ]);
            if CRC32.checksum(&self.buf[..total - CRC_LEN]) != expected {
                // Length fields were sane, so skip the whole damaged frame
                // rather than crawling through it byte by byte.
                self.error_count += 1;
                self.consecutive_resyncs += 1;
                if self.consecutive_resyncs >= MAX_CONSECUTIVE_RESYNCS {
                    return Err(FrameDecodeError::TooManyResyncs(self.consecutive_resyncs));
                }
                self.buf.advance(total);
                continue;
            }

            let frame = self.buf.split_to(total);
            self.consecutive_resyncs = 0;
            let headers = &frame[PRELUDE_LEN..PRELUDE_LEN + headers_len];
            let payload = &frame[PRELUDE_LEN + headers_len..total - CRC_LEN];

            let Some(event_type) = extract_event_type(headers) else {
                self.error_count += 1;
                continue;
            };
            match serde_json::from_slice::<Value>(payload) {
                Ok(payload) => frames.push(EventFrame {
                    event_type,
                    payload,
                }),
                Err(_) => self.error_count += 1,
            }
        }

        Ok(frames)
    }

    fn resync(&mut self) -> Result<(), FrameDecodeError> {
        self.error_count += 1;
        self.consecutive_resyncs += 1;
        if self.consecutive_resyncs >= MAX_CONSECUTIVE_RESYNCS {
            return Err(FrameDecodeError::TooManyResyncs(self.consecutive_resyncs));
        }
        self.buf.advance(1);
        Ok(())
    }
}

/// Walk the typed header fields looking for the string-typed
/// `:event-type`. Unknown header types abort the walk (sizes unknowable).
fn extract_event_type(mut headers: &[u8]) -> Option<String> {
    while !headers.is_empty() {
        let name_len = headers[0] as usize;
        headers = headers.get(1..)?;
        let name = headers.get(..name_len)?;
        headers = headers.get(name_len..)?;

        let value_type = *headers.first()?;
        headers = headers.get(1..)?;

        let value_len = match value_type {
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            4 => 4,
            5 | 8 => 8,
            6 | 7 => {
                let len = u16::from_be_bytes([*headers.first()?, *headers.get(1)?]) as usize;
                headers = headers.get(2..)?;
                len
            }
            9 => 16,
            _ => return None,
        };
        let value = headers.get(..value_len)?;
        headers = headers.get(value_len..)?;

        if value_type == HEADER_TYPE_STRING && name == EVENT_TYPE_HEADER.as_bytes() {
            return String::from_utf8(value.to_vec()).ok();
        }
    }
    None
}

#[cfg(test)]
pub(crate) fn encode_frame(event_type: &str, payload: &Value) -> Vec<u8> {
    let payload = serde_json::to_vec(payload).expect("payload");
    let mut headers = Vec::new();
    headers.push(EVENT_TYPE_HEADER.len() as u8);
    headers.extend_from_slice(EVENT_TYPE_HEADER.as_bytes());
    headers.push(HEADER_TYPE_STRING);
    headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
    headers.extend_from_slice(event_type.as_bytes());

    let total = PRELUDE_LEN + headers.len() + payload.len() + CRC_LEN;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    frame.extend_from_slice(&headers);
    frame.extend_from_slice(&payload);
    let crc = CRC32.checksum(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}
