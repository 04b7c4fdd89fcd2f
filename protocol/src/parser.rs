//! Incremental decoder for the generation event stream.
//!
//! The backend sends line-oriented records, each prefixed with a marker
//! (`data:` by default). Chunks may split records, and even UTF-8 sequences,
//! at arbitrary byte boundaries, so the parser buffers raw bytes until a full
//! line is available.
//!
//! A record that cannot be decoded is dropped on its own. Nothing a single
//! record contains can stop the stream.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::event::GenerationEvent;

/// Default marker prefixing every record line.
pub const DEFAULT_RECORD_MARKER: &str = "data:";

/// Default upper bound for a single record line.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Parser configuration.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Prefix that marks a line as a record.
    pub marker: String,

    /// Lines longer than this are dropped.
    pub max_record_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            marker: DEFAULT_RECORD_MARKER.to_string(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

impl ParserConfig {
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }
}

/// Counters describing what the parser did with the records it saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Records decoded into events (including unknown ones).
    pub decoded: usize,

    /// Decoded records without a recognized `type`.
    pub unknown: usize,

    /// Empty or unframed payloads such as `[DONE]`.
    pub skipped: usize,

    /// Records that failed to decode or exceeded the size limit.
    pub malformed: usize,
}

/// Incremental record parser for one connection.
#[derive(Debug, Default)]
pub struct EventParser {
    config: ParserConfig,
    buffer: Vec<u8>,
    discarding: bool,
    stats: ParserStats,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ParserConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Feed a chunk of raw bytes and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<GenerationEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if self.discarding {
                // Tail of an oversized line.
                self.discarding = false;
            } else if let Some(event) =
                parse_record(&self.config, &mut self.stats, &self.buffer[start..end])
            {
                events.push(event);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > self.config.max_record_bytes {
            self.buffer.clear();
            if !self.discarding {
                warn!(
                    "Dropping record exceeding {} bytes",
                    self.config.max_record_bytes
                );
                self.discarding = true;
                self.stats.malformed += 1;
            }
        }

        events
    }

    /// Flush a trailing record that was not terminated by a newline.
    pub fn finish(&mut self) -> Option<GenerationEvent> {
        let line = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) || line.is_empty() {
            return None;
        }
        parse_record(&self.config, &mut self.stats, &line)
    }
}

fn parse_record(
    config: &ParserConfig,
    stats: &mut ParserStats,
    line: &[u8],
) -> Option<GenerationEvent> {
    if line.len() > config.max_record_bytes {
        debug!("Skipping oversized record ({} bytes)", line.len());
        stats.malformed += 1;
        return None;
    }

    let Ok(text) = std::str::from_utf8(line) else {
        debug!("Skipping record with invalid UTF-8");
        stats.malformed += 1;
        return None;
    };

    // Non-record lines (event names, ids, keep-alive comments) are ignored.
    let payload = text.trim_end_matches('\r').strip_prefix(config.marker.as_str())?;
    let payload = payload.trim();

    if !is_balanced_object(payload) {
        trace!("Skipping unframed payload: {payload:?}");
        stats.skipped += 1;
        return None;
    }

    let decoded = serde_json::from_str::<Value>(payload).and_then(GenerationEvent::from_value);
    match decoded {
        Ok(event) => {
            stats.decoded += 1;
            if event.kind().is_none() {
                debug!("Forwarding record with unrecognized type");
                stats.unknown += 1;
            }
            Some(event)
        }
        Err(e) => {
            debug!("Skipping malformed record: {e}");
            stats.malformed += 1;
            None
        }
    }
}

/// Cheap structural check before attempting a full decode: the payload must
/// be a single `{...}` object with balanced braces outside string literals.
fn is_balanced_object(payload: &str) -> bool {
    if !(payload.starts_with('{') && payload.ends_with('}')) {
        return false;
    }

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in payload.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth < 0 || (depth == 0 && index + ch.len_utf8() != payload.len()) {
                    return false;
                }
            }
            _ => {}
        }
    }

    depth == 0 && !in_string
}

/// Decode a stream of byte chunks into a stream of events.
///
/// Transport errors are passed through and end the stream. A trailing record
/// without a newline is flushed when the input ends.
pub fn decode_stream<S, E>(
    chunks: S,
    config: ParserConfig,
) -> impl Stream<Item = Result<GenerationEvent, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    async_stream::stream! {
        let mut parser = EventParser::with_config(config);
        let mut chunks = std::pin::pin!(chunks);

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in parser.push(&bytes) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(event) = parser.finish() {
            yield Ok(event);
        }

        let stats = parser.stats();
        debug!(
            "Stream closed: {} decoded, {} skipped, {} malformed",
            stats.decoded, stats.skipped, stats.malformed
        );
    }
}
