//! Frame codec: JSON text frames under a hard size ceiling.
//!
//! Streaming text (`trace`, `output`) is pre-split into chunks well below the
//! ceiling so a long run never produces an oversized frame. Receivers rebuild
//! the text by appending chunks in arrival order; see [`RunBuffers`].

use serde::Serialize;
use serde_json::Value;

use crate::messages::{ResponseEnvelope, RunEnd, RunProgress, ServerEvent, ServerMessage};

pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
/// Leaves room for the envelope and worst-case JSON escaping of a chunk.
pub const CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error("failed to serialize frame: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unrecognized frame: {0}")]
    Unrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    chunk_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self { max_frame_bytes: MAX_FRAME_BYTES, chunk_bytes: CHUNK_BYTES }
    }
}

impl FrameCodec {
    /// `chunk_bytes` is clamped below the ceiling and to at least one
    /// character's worth of UTF-8.
    pub fn new(max_frame_bytes: usize, chunk_bytes: usize) -> Self {
        let chunk_bytes = chunk_bytes.min(max_frame_bytes / 2).max(4);
        Self { max_frame_bytes, chunk_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Single frame; nothing is split.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<String, FrameError> {
        let text = serde_json::to_string(message).map_err(FrameError::Serialize)?;
        if text.len() > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge { size: text.len(), max: self.max_frame_bytes });
        }
        Ok(text)
    }

    pub fn encode_event(&self, event: &ServerEvent) -> Result<Vec<String>, FrameError> {
        match event {
            ServerEvent::RunProgress(progress) => self.encode_progress(progress),
            ServerEvent::RunEnd(end) => Ok(vec![self.encode_end(end)?]),
            other => Ok(vec![self.encode(other)?]),
        }
    }

    /// Trace chunks first, then output chunks, each tagged with the run id and
    /// the `inner` flag of the source event.
    pub fn encode_progress(&self, progress: &RunProgress) -> Result<Vec<String>, FrameError> {
        let mut frames = Vec::new();
        if let Some(trace) = progress.trace.as_deref() {
            for piece in split_text(trace, self.chunk_bytes) {
                frames.push(self.encode(&ServerEvent::RunProgress(RunProgress {
                    run_id: progress.run_id.clone(),
                    trace: Some(piece.to_string()),
                    output: None,
                    inner: progress.inner,
                }))?);
            }
        }
        if let Some(output) = progress.output.as_deref() {
            for piece in split_text(output, self.chunk_bytes) {
                frames.push(self.encode(&ServerEvent::RunProgress(RunProgress {
                    run_id: progress.run_id.clone(),
                    trace: None,
                    output: Some(piece.to_string()),
                    inner: progress.inner,
                }))?);
            }
        }
        Ok(frames)
    }

    /// Falls back to [`RunEnd::compact`] when the full terminal event would not
    /// fit in one frame.
    pub fn encode_end(&self, end: &RunEnd) -> Result<String, FrameError> {
        let event = ServerEvent::RunEnd(end.clone());
        match self.encode(&event) {
            Err(FrameError::FrameTooLarge { size, .. }) => {
                tracing::debug!(run_id = %end.run_id, size, "compacting oversized run.end");
                self.encode(&ServerEvent::RunEnd(end.compact()))
            }
            other => other,
        }
    }

    pub fn decode(&self, text: &str) -> Result<ServerMessage, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(FrameError::Malformed)?;
        let is_response = value.as_object().is_some_and(|o| o.contains_key("response"));
        if is_response {
            let envelope: ResponseEnvelope =
                serde_json::from_value(value).map_err(FrameError::Malformed)?;
            return Ok(ServerMessage::Response(envelope));
        }
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        serde_json::from_value::<ServerEvent>(value)
            .map(ServerMessage::Event)
            .map_err(|_| FrameError::Unrecognized(kind))
    }
}

/// Split `text` into pieces of at most `max_bytes`, never inside a UTF-8
/// sequence. Empty input yields no pieces.
pub fn split_text(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(4);
    let mut pieces = Vec::with_capacity(text.len() / max_bytes + 1);
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= max_bytes {
            pieces.push(rest);
            break;
        }
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces
}

/// Receiver-side reassembly of one run's streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunBuffers {
    pub trace: String,
    pub output: String,
    /// Output produced by nested prompts; kept apart from the main output.
    pub inner: String,
}

impl RunBuffers {
    pub fn apply(&mut self, progress: &RunProgress) {
        if let Some(trace) = progress.trace.as_deref() {
            self.trace.push_str(trace);
        }
        if let Some(output) = progress.output.as_deref() {
            if progress.inner {
                self.inner.push_str(output);
            } else {
                self.output.push_str(output);
            }
        }
    }
}
