//! Line-level decoding of the chat response stream.
//!
//! The server writes one JSON record per line, optionally prefixed with
//! `data: `. Each record carries a fragment of assistant text in
//! `message.content` and a `done` flag on the last record.

use std::pin::Pin;

use futures_util::{Stream, StreamExt, stream};
use serde::Deserialize;

use crate::error::ReviewError;

const EVENT_PREFIX: &str = "data: ";

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Non-empty assistant text, if the record carried any.
    pub content: Option<String>,
    /// The server marked this record as the last one.
    pub done: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// Decode a single response line.
///
/// Returns `Ok(None)` for lines that carry nothing: blank lines and lines that
/// fail to parse. Parse failures are logged and skipped; they never end the
/// stream. A record with an `error` field is returned as a response error.
pub fn decode_line(line: &str) -> Result<Option<Frame>, ReviewError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let payload = line.strip_prefix(EVENT_PREFIX).unwrap_or(line);

    let chunk: ChatChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            let err = ReviewError::Decode(e.to_string());
            tracing::warn!(line = payload, "skipping undecodable stream line: {err}");
            return Ok(None);
        }
    };

    if let Some(message) = chunk.error {
        return Err(ReviewError::response(message));
    }

    let content = chunk
        .message
        .map(|m| m.content)
        .filter(|c| !c.is_empty());

    Ok(Some(Frame {
        content,
        done: chunk.done,
    }))
}

/// Decode a raw line. Invalid UTF-8 is skipped like any other unparsable line.
pub fn decode_bytes(line: &[u8]) -> Result<Option<Frame>, ReviewError> {
    match std::str::from_utf8(line) {
        Ok(text) => decode_line(text),
        Err(e) => {
            let err = ReviewError::Decode(e.to_string());
            tracing::warn!(bytes = line.len(), "skipping undecodable stream line: {err}");
            Ok(None)
        }
    }
}

/// Turn a stream of raw lines into a stream of tokens.
///
/// The output ends after the first `done` record, after the first error
/// (which is yielded once), or when the input runs out.
pub fn decode_lines<S, L>(lines: S) -> impl Stream<Item = Result<String, ReviewError>> + Send
where
    S: Stream<Item = Result<L, ReviewError>> + Send + 'static,
    L: AsRef<[u8]> + Send + 'static,
{
    let lines: Pin<Box<S>> = Box::pin(lines);
    stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        loop {
            let line = match lines.next().await? {
                Ok(line) => line,
                Err(e) => return Some((Err(e), None)),
            };
            match decode_bytes(line.as_ref()) {
                Ok(None) => continue,
                Ok(Some(Frame { content, done })) => {
                    if done {
                        tracing::debug!("stream completed");
                        return content.map(|token| (Ok(token), None));
                    }
                    if let Some(token) = content {
                        return Some((Ok(token), Some(lines)));
                    }
                }
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
}
