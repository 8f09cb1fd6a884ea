//! Server-Sent Events decoding
//!
//! Splits a byte stream into SSE frames (`id:`, `event:`, multi-line `data:`,
//! blank-line terminated) and maps each frame onto a [`WireEvent`]. Comment
//! lines carry keep-alives and surface as `keep_alive` records.

use bytes::{Buf, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;

use runwatch_core::{WireEvent, WireType};

use crate::error::{ClientError, Result};

/// One assembled SSE frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Vec<String>,
    /// The frame consisted of comment lines only
    pub comment: bool,
}

impl SseFrame {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.event.is_none() && self.data.is_empty() && !self.comment
    }

    /// Convert to a wire record; the event name selects the type.
    pub fn into_wire(self) -> Result<WireEvent> {
        if self.event.is_none() && self.data.is_empty() {
            return Ok(WireEvent::keep_alive());
        }

        let name = self.event.as_deref().unwrap_or("message");
        let kind = WireType::parse(name)
            .ok_or_else(|| ClientError::InvalidFrame(format!("unknown event type '{}'", name)))?;

        let raw = self.data.join("\n");
        let data = if raw.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&raw)?
        };

        Ok(WireEvent {
            id: self.id.filter(|id| !id.is_empty()),
            kind,
            data,
        })
    }
}

/// Incremental SSE decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    frame: SseFrame,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every frame they complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(end);
            self.buffer.advance(1);

            let line = String::from_utf8_lossy(&line);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that was not blank-line terminated.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let rest = String::from_utf8_lossy(&rest).into_owned();
            if let Some(frame) = self.line(rest.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        let frame = std::mem::take(&mut self.frame);
        (!frame.is_empty()).then_some(frame)
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            let frame = std::mem::take(&mut self.frame);
            return (!frame.is_empty()).then_some(frame);
        }

        if line.starts_with(':') {
            self.frame.comment = true;
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.frame.id = Some(value.to_string()),
            "event" => self.frame.event = Some(value.to_string()),
            "data" => self.frame.data.push(value.to_string()),
            // `retry` and unknown fields are ignored
            _ => {}
        }
        None
    }
}

/// Decode a response body into wire records.
pub fn wire_events<S, E>(body: S) -> impl Stream<Item = Result<WireEvent>>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: Into<ClientError>,
{
    stream::unfold(
        (body, SseDecoder::new(), false),
        |(mut body, mut decoder, finished)| async move {
            if finished {
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => {
                    let frames: Vec<_> = decoder
                        .push(&chunk)
                        .into_iter()
                        .map(SseFrame::into_wire)
                        .collect();
                    Some((frames, (body, decoder, false)))
                }
                Some(Err(e)) => Some((vec![Err(e.into())], (body, decoder, true))),
                None => {
                    let rest: Vec<_> = decoder.finish().map(SseFrame::into_wire).into_iter().collect();
                    Some((rest, (body, decoder, true)))
                }
            }
        },
    )
    .flat_map(stream::iter)
}
