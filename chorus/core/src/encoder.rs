//! Event Stream Wire Format
//!
//! Session events are written as server-sent-event frames:
//!
//! ```text
//! event: model-update
//! data: {"model":"a","chunk":"llo","full_text":"Hello"}
//!
//! ```
//!
//! Each event becomes exactly one frame and each frame ends with a blank
//! line, so a client reading line by line can act on every frame as soon as
//! it arrives. JSON payloads are written compactly; `serde_json` escapes
//! embedded newlines, so `data` is always a single line.
//!
//! Passthrough relays use the data-only form (`data: <json>\n\n`).

use serde_json::Value;

use crate::streaming::SessionEvent;

/// Content type of an encoded event stream
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Encode one tagged frame
#[must_use]
pub fn encode_frame(tag: &str, payload: &Value) -> String {
    format!("event: {tag}\ndata: {payload}\n\n")
}

/// Encode one data-only frame
#[must_use]
pub fn encode_data(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

/// Encoder for session event output
#[derive(Debug, Default, Clone, Copy)]
pub struct EventEncoder;

impl EventEncoder {
    /// Create a new encoder
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encode a session event to one frame
    #[must_use]
    pub fn encode(&self, event: &SessionEvent) -> String {
        encode_frame(event.tag(), &event.payload())
    }
}

/// A frame read back from an event stream
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    /// The `event:` tag, absent for data-only frames
    pub event: Option<String>,
    /// The `data:` payload
    pub data: Value,
}

/// Incremental reader for event stream bodies.
///
/// Buffers partial input and yields each frame once its terminating blank
/// line has arrived.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: String,
}

impl EventDecoder {
    /// Create a new decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text and return every frame it completes.
    ///
    /// Frames whose data is not JSON are returned with the data as a string.
    pub fn push(&mut self, text: &str) -> Vec<DecodedFrame> {
        self.buffer.push_str(text);

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<DecodedFrame> {
    let mut event = None;
    let mut data: Option<String> = None;

    for line in block.lines() {
        if let Some(tag) = line.strip_prefix("event:") {
            event = Some(tag.trim().to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            match &mut data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(payload);
                }
                None => data = Some(payload.to_string()),
            }
        }
    }

    let data = data?;
    let data = serde_json::from_str(&data).unwrap_or(Value::String(data));
    Some(DecodedFrame { event, data })
}
