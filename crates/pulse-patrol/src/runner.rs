//! Driving one LLM call and collecting what it did
//!
//! A [`PatrolRunner`] starts a prompt and hands back the normalized event
//! stream along with the runtime session it runs in. [`collect`] drains that
//! stream into a [`Transcript`]: the final text, token usage and a
//! [`ToolCallRecord`] per completed tool call.

use async_trait::async_trait;
use pulse_core::{Error, Result};
use pulse_llm::{bridge, PromptRequest, Sidecar, StreamEvent, StreamEventKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stored tool inputs are cut to this many bytes
pub const MAX_TOOL_INPUT_LEN: usize = 4 * 1024;
/// Stored tool outputs are cut to this many bytes; signal detection reads
/// the untruncated text
pub const MAX_TOOL_OUTPUT_LEN: usize = 16 * 1024;

/// One prompt to the runtime
#[derive(Debug, Clone)]
pub struct PatrolRequest {
    pub prompt: String,
    pub system: String,
    /// Logical session name, e.g. `patrol-main`
    pub session: String,
    pub model: String,
    /// Tool calls beyond this end the run
    pub max_turns: usize,
}

/// A started prompt
pub struct PatrolStream {
    /// Runtime session the prompt runs in; empty when the runner has none
    pub session_id: String,
    pub events: mpsc::Receiver<StreamEvent>,
}

#[async_trait]
pub trait PatrolRunner: Send + Sync {
    async fn start(&self, request: PatrolRequest) -> Result<PatrolStream>;

    /// Stop a session that is still generating, e.g. after the turn budget
    /// ran out
    async fn abort(&self, session_id: &str) -> Result<()>;
}

/// Runs patrol prompts through the supervised OpenCode runtime
pub struct OpenCodeRunner {
    sidecar: Arc<Sidecar>,
}

impl OpenCodeRunner {
    pub fn new(sidecar: Arc<Sidecar>) -> Self {
        Self { sidecar }
    }
}

#[async_trait]
impl PatrolRunner for OpenCodeRunner {
    async fn start(&self, request: PatrolRequest) -> Result<PatrolStream> {
        let client = self.sidecar.client().await?;
        let mut prompt = PromptRequest::new(request.prompt)
            .with_session(request.session)
            .with_system(request.system);
        if !request.model.is_empty() {
            prompt = prompt.with_model(request.model);
        }
        let stream = client.prompt_stream(&prompt).await?;
        Ok(PatrolStream {
            session_id: stream.session_id.clone(),
            events: bridge(stream),
        })
    }

    async fn abort(&self, session_id: &str) -> Result<()> {
        let client = self.sidecar.client().await?;
        client.abort_session(session_id).await?;
        debug!(session_id = %session_id, "Aborted patrol session");
        Ok(())
    }
}

// ============================================================================
// TRANSCRIPT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    /// Display name, `pulse_` prefix stripped
    pub name: String,
    pub input: String,
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
pub struct Transcript {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Full outputs, index-aligned with `tool_calls`
    pub raw_outputs: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// The turn budget ran out before the model finished
    pub truncated: bool,
}

impl Transcript {
    /// Records with their untruncated outputs, for signal detection
    pub fn full_tool_calls(&self) -> Vec<ToolCallRecord> {
        self.tool_calls
            .iter()
            .zip(&self.raw_outputs)
            .map(|(call, raw)| ToolCallRecord {
                output: raw.clone(),
                ..call.clone()
            })
            .collect()
    }

    pub fn push_call(&mut self, mut record: ToolCallRecord) {
        let raw = record.output.clone();
        record.input = truncate(&record.input, MAX_TOOL_INPUT_LEN);
        record.output = truncate(&record.output, MAX_TOOL_OUTPUT_LEN);
        self.tool_calls.push(record);
        self.raw_outputs.push(raw);
    }
}

struct Pending {
    name: String,
    input: String,
    started: Instant,
}

/// Drain `events` until `done`. An `error` event or a stream that ends
/// without `done` is a failed run; running past `max_turns` tool calls stops
/// reading and keeps what was collected.
pub async fn collect(mut events: mpsc::Receiver<StreamEvent>, max_turns: usize) -> Result<Transcript> {
    let mut transcript = Transcript::default();
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut order: VecDeque<String> = VecDeque::new();
    let mut anon = 0usize;
    let mut started = 0usize;

    loop {
        let Some(event) = events.recv().await else {
            return Err(Error::external("patrol stream ended before completion"));
        };
        match event.kind {
            StreamEventKind::Content => {
                if let Some(text) = event.text() {
                    transcript.content.push_str(text);
                }
            }
            StreamEventKind::ToolStart => {
                started += 1;
                if started > max_turns {
                    warn!(max_turns, "Patrol turn budget exhausted, stopping run");
                    transcript.truncated = true;
                    return Ok(transcript);
                }
                let id = match event.tool_id() {
                    Some(id) if !id.is_empty() => id.to_string(),
                    _ => {
                        anon += 1;
                        format!("patrol-anon-{}", anon)
                    }
                };
                order.push_back(id.clone());
                pending.insert(
                    id,
                    Pending {
                        name: str_field(&event.data, "name"),
                        input: input_field(&event.data),
                        started: Instant::now(),
                    },
                );
            }
            StreamEventKind::ToolEnd | StreamEventKind::ApprovalNeeded => {
                let id = match event.tool_id() {
                    Some(id) if !id.is_empty() => {
                        order.retain(|p| p != id);
                        id.to_string()
                    }
                    _ => match order.pop_front() {
                        Some(id) => id,
                        None => {
                            anon += 1;
                            format!("patrol-anon-end-{}", anon)
                        }
                    },
                };
                transcript.push_call(end_record(id.clone(), pending.remove(&id), &event));
            }
            StreamEventKind::Done => {
                if let Some(usage) = event.data.as_object() {
                    let tokens = |k: &str| usage.get(k).and_then(Value::as_u64).unwrap_or(0);
                    transcript.input_tokens += tokens("input_tokens");
                    transcript.output_tokens += tokens("output_tokens");
                }
                debug!(
                    tool_calls = transcript.tool_calls.len(),
                    input_tokens = transcript.input_tokens,
                    output_tokens = transcript.output_tokens,
                    "Patrol stream complete"
                );
                return Ok(transcript);
            }
            StreamEventKind::Error => {
                let message = event.text().unwrap_or("unknown stream error");
                return Err(Error::external(message.to_string()));
            }
            StreamEventKind::Thinking | StreamEventKind::Question => {}
        }
    }
}

fn end_record(id: String, pending: Option<Pending>, event: &StreamEvent) -> ToolCallRecord {
    let data = &event.data;
    let (name, mut input, duration_ms) = match pending {
        Some(p) => (p.name, p.input, p.started.elapsed().as_millis() as u64),
        None => (String::new(), String::new(), 0),
    };
    let end_input = input_field(data);
    if !end_input.is_empty() {
        input = end_input;
    }
    let name = match str_field(data, if event.kind == StreamEventKind::ApprovalNeeded { "tool_name" } else { "name" }) {
        n if n.is_empty() => name,
        n => n,
    };
    let (output, success) = if event.kind == StreamEventKind::ApprovalNeeded {
        (data.to_string(), false)
    } else {
        (
            str_field(data, "output"),
            data.get("success").and_then(Value::as_bool).unwrap_or(true),
        )
    };
    ToolCallRecord {
        id,
        name,
        input,
        output,
        success,
        duration_ms,
    }
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// `raw_input` wins over `input`; object inputs are re-encoded
fn input_field(data: &Value) -> String {
    for key in ["raw_input", "input"] {
        match data.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(v @ Value::Object(_)) => return v.to_string(),
            _ => {}
        }
    }
    String::new()
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn feed(events: Vec<StreamEvent>, max_turns: usize) -> Result<Transcript> {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for ev in events {
            tx.send(ev).await.unwrap();
        }
        drop(tx);
        collect(rx, max_turns).await
    }

    #[tokio::test]
    async fn test_pairs_by_id_and_collects_usage() {
        let t = feed(
            vec![
                StreamEvent::new(StreamEventKind::ToolStart, json!({"id": "a", "name": "query", "input": {"action": "health"}})),
                StreamEvent::new(StreamEventKind::ToolStart, json!({"id": "b", "name": "list_storage"})),
                StreamEvent::new(StreamEventKind::ToolEnd, json!({"id": "b", "name": "list_storage", "output": "{}", "success": true})),
                StreamEvent::new(StreamEventKind::ToolEnd, json!({"id": "a", "name": "query", "output": "ok", "success": false})),
                StreamEvent::content("### Status"),
                StreamEvent::new(StreamEventKind::Done, json!({"input_tokens": 120, "output_tokens": 30})),
            ],
            20,
        )
        .await
        .unwrap();
        assert_eq!(t.tool_calls.len(), 2);
        assert_eq!(t.tool_calls[0].id, "b");
        assert_eq!(t.tool_calls[1].input, r#"{"action":"health"}"#);
        assert!(!t.tool_calls[1].success);
        assert_eq!(t.content, "### Status");
        assert_eq!((t.input_tokens, t.output_tokens), (120, 30));
    }

    #[tokio::test]
    async fn test_anonymous_ids_pair_in_order() {
        let t = feed(
            vec![
                StreamEvent::new(StreamEventKind::ToolStart, json!({"name": "query"})),
                StreamEvent::new(StreamEventKind::ToolStart, json!({"name": "get_metrics"})),
                StreamEvent::new(StreamEventKind::ToolEnd, json!({"output": "first"})),
                StreamEvent::new(StreamEventKind::ToolEnd, json!({"output": "second"})),
                StreamEvent::new(StreamEventKind::ToolEnd, json!({"name": "stray", "output": "third"})),
                StreamEvent::done(),
            ],
            20,
        )
        .await
        .unwrap();
        let ids: Vec<_> = t.tool_calls.iter().map(|c| (c.id.as_str(), c.name.as_str())).collect();
        assert_eq!(
            ids,
            vec![
                ("patrol-anon-1", "query"),
                ("patrol-anon-2", "get_metrics"),
                ("patrol-anon-end-3", "stray"),
            ]
        );
    }

    #[tokio::test]
    async fn test_turn_budget_truncates() {
        let mut events = Vec::new();
        for i in 0..5 {
            events.push(StreamEvent::new(StreamEventKind::ToolStart, json!({"id": format!("t{}", i), "name": "query"})));
            events.push(StreamEvent::new(StreamEventKind::ToolEnd, json!({"id": format!("t{}", i), "output": "x"})));
        }
        let t = feed(events, 3).await.unwrap();
        assert!(t.truncated);
        assert_eq!(t.tool_calls.len(), 3);
    }

    #[tokio::test]
    async fn test_error_and_early_close_fail() {
        let err = feed(vec![StreamEvent::error("status 429 rate limit")], 20).await.unwrap_err();
        assert!(err.to_string().contains("rate limit"));
        assert!(feed(vec![StreamEvent::content("partial")], 20).await.is_err());
    }

    #[test]
    fn test_outputs_truncated_but_raw_kept() {
        let mut t = Transcript::default();
        t.push_call(ToolCallRecord {
            output: "é".repeat(MAX_TOOL_OUTPUT_LEN),
            ..Default::default()
        });
        assert!(t.tool_calls[0].output.len() < MAX_TOOL_OUTPUT_LEN + 4);
        assert_eq!(t.full_tool_calls()[0].output.len(), 2 * MAX_TOOL_OUTPUT_LEN);
    }
}
