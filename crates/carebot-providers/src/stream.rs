//! Server-sent event decoding for streamed chat completions.
//!
//! Tool-call arguments arrive as fragments spread over many deltas, keyed by
//! the call's `index`; they are stitched together and emitted once the stream
//! finishes.

use std::collections::BTreeMap;

use carebot_core::error::{CarebotError, Result};
use carebot_core::types::{StreamEvent, ToolCall};
use serde_json::Value;

/// Splits a byte stream into SSE `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes, returning every complete `data:` payload.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(data) = parse_line(&line) {
                out.push(data);
            }
        }
        out
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buf);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data).to_string())
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns chat-completion chunks into [`StreamEvent`]s.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<String>,
    finished: bool,
}

impl DeltaAccumulator {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Apply one `data:` payload.
    pub fn apply(&mut self, data: &str) -> Result<Vec<StreamEvent>> {
        if self.finished {
            return Ok(vec![]);
        }
        if data.trim() == "[DONE]" {
            return Ok(self.finish());
        }

        let json: Value = serde_json::from_str(data)
            .map_err(|e| CarebotError::Provider(format!("malformed stream chunk: {e}")))?;
        if let Some(err) = json.get("error") {
            let message = err["message"].as_str().unwrap_or("unknown error");
            return Err(CarebotError::Provider(format!("stream error: {message}")));
        }

        let mut events = Vec::new();
        let Some(choice) = json["choices"].get(0) else {
            return Ok(events);
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text.to_string()));
            }
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for (pos, call) in calls.iter().enumerate() {
                let index = call["index"].as_u64().unwrap_or(pos as u64);
                let partial = self.calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    partial.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    partial.name.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    partial.arguments.push_str(args);
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        Ok(events)
    }

    /// Emit the assembled tool calls and the final event. Runs once.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return vec![];
        }
        self.finished = true;

        let mut events: Vec<StreamEvent> = std::mem::take(&mut self.calls)
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| {
                let id = if call.id.is_empty() {
                    format!("call_{index}")
                } else {
                    call.id
                };
                let arguments = if call.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                };
                StreamEvent::ToolCall(ToolCall::new(id, call.name, arguments))
            })
            .collect();
        events.push(StreamEvent::Finished {
            finish_reason: self.finish_reason.take(),
        });
        events
    }
}
