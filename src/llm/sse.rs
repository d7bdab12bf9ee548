//! Assembles an event-stream completion body into assistant text.
//!
//! Each delta arrives as a `data: {json}` line and the body ends with
//! `data: [DONE]`. Chunk boundaries fall anywhere, including inside a
//! multi-byte character or a JSON payload.

use std::collections::VecDeque;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tracing::debug;

use super::openai::classify;
use crate::error::Result;
use crate::platform::ByteStream;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// `choices[0].delta.content`
    Content(String),
    /// `choices[0].delta.tool_calls[0].function.arguments`
    ToolCall(String),
    Unrecognized,
}

impl StreamEvent {
    pub fn text(&self) -> Option<&str> {
        match self {
            StreamEvent::Content(text) | StreamEvent::ToolCall(text) => Some(text),
            StreamEvent::Unrecognized => None,
        }
    }
}

/// Incremental UTF-8 decoding that holds back an incomplete trailing
/// sequence until the next chunk completes it.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

enum Line {
    Skip,
    Done,
    Payload(Value),
    Incomplete,
}

fn parse_line(line: &str) -> Line {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.starts_with(':') || line.trim().is_empty() {
        return Line::Skip;
    }
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Line::Skip;
    };
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Line::Done;
    }
    match serde_json::from_str(data) {
        Ok(payload) => Line::Payload(payload),
        Err(_) => Line::Incomplete,
    }
}

/// Buffer, accumulated text and completion flag of one streamed response.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    decoder: Utf8Decoder,
    buffer: String,
    accumulated: String,
    done: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds one chunk and returns the fragments it completed. A line that
    /// does not parse yet goes back to the front of the buffer and waits for
    /// more bytes.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        let text = self.decoder.decode(bytes);
        self.buffer.push_str(&text);

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.strip_suffix('\n').unwrap_or(&line).to_string();
            match parse_line(&line) {
                Line::Skip => continue,
                Line::Done => {
                    self.done = true;
                    self.buffer.clear();
                    break;
                }
                Line::Payload(payload) => self.collect(payload, &mut events),
                Line::Incomplete => {
                    let line = line.strip_suffix('\r').unwrap_or(&line);
                    self.buffer.insert(0, '\n');
                    self.buffer.insert_str(0, line);
                    break;
                }
            }
        }
        events
    }

    /// Best-effort pass over whatever is still buffered once the stream has
    /// ended. Unparseable leftovers are discarded.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        let leftover = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        if leftover.trim().is_empty() {
            return events;
        }
        for line in leftover.split('\n') {
            match parse_line(line) {
                Line::Payload(payload) => self.collect(payload, &mut events),
                Line::Incomplete => debug!(line, "discarding partial stream data"),
                Line::Skip | Line::Done => {}
            }
        }
        events
    }

    fn collect(&mut self, payload: Value, events: &mut Vec<StreamEvent>) {
        for event in classify(payload) {
            if let Some(text) = event.text() {
                self.accumulated.push_str(text);
                events.push(event);
            }
        }
    }
}

struct DeltaState {
    source: ByteStream,
    assembler: StreamAssembler,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

/// Lazily turns a response body into its content and tool-call fragments,
/// in arrival order. The sequence ends after `[DONE]` or when the body is
/// exhausted, and cannot be restarted.
pub fn fragments(source: ByteStream) -> BoxStream<'static, Result<StreamEvent>> {
    let state = DeltaState {
        source,
        assembler: StreamAssembler::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            if state.assembler.is_done() {
                let tail = state.assembler.finish();
                state.pending.extend(tail);
                state.finished = true;
                continue;
            }
            match state.source.next().await {
                Some(Ok(bytes)) => {
                    let events = state.assembler.push(&bytes);
                    state.pending.extend(events);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    let tail = state.assembler.finish();
                    state.pending.extend(tail);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
