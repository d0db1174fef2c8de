pub mod client;
pub mod decoder;
pub mod dns;
pub mod endpoints;
pub mod events;
pub mod fingerprint;
pub mod refresh;
pub mod toolbuf;

pub use client::{UpstreamClient, UpstreamConfig, UpstreamEvent};
pub use decoder::{EventFrame, FrameDecodeError, FrameDecoder};
pub use events::UpstreamError;
