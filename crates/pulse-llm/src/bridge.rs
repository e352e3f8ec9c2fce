//! Stream bridge
//!
//! Turns runtime events into the public event schema consumed by the chat UI
//! and the patrol loop. Every raw event maps to exactly one public event.
//! The only rewrite is approval extraction: a `tool_end` whose output is the
//! approval sentinel becomes `approval_needed`.

use pulse_core::control::APPROVAL_PREFIX;
use pulse_core::spawn_guarded;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::client::{PromptStream, RawEvent};

/// Tool names are shown without this prefix
pub const TOOL_NAME_PREFIX: &str = "pulse_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Content,
    Thinking,
    ToolStart,
    ToolEnd,
    ApprovalNeeded,
    Question,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind, data: Value) -> Self {
        Self { kind, data }
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Content, Value::String(text.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Error, Value::String(message.into()))
    }

    pub fn done() -> Self {
        Self::new(StreamEventKind::Done, Value::Null)
    }

    /// Text payload of content, thinking and error events
    pub fn text(&self) -> Option<&str> {
        self.data.as_str()
    }

    /// Call id of tool and approval events
    pub fn tool_id(&self) -> Option<&str> {
        let key = match self.kind {
            StreamEventKind::ApprovalNeeded => "tool_id",
            _ => "id",
        };
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Display name of a tool
pub fn ui_tool_name(name: &str) -> &str {
    name.strip_prefix(TOOL_NAME_PREFIX).unwrap_or(name)
}

/// Parse the payload of an approval sentinel
pub fn parse_approval(output: &str) -> Option<Map<String, Value>> {
    let body = output.trim_start().strip_prefix(APPROVAL_PREFIX)?;
    match serde_json::from_str::<Value>(body.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => {
            warn!("Malformed approval sentinel in tool output");
            None
        }
    }
}

pub fn normalize(raw: RawEvent) -> StreamEvent {
    let kind = match raw.kind.as_str() {
        "content" => StreamEventKind::Content,
        "thinking" => StreamEventKind::Thinking,
        "question" => StreamEventKind::Question,
        "done" => StreamEventKind::Done,
        "error" => StreamEventKind::Error,
        "tool_start" => return StreamEvent::new(StreamEventKind::ToolStart, tool_data(raw.data)),
        "tool_end" => return tool_end(raw.data),
        _ => {
            let body = serde_json::to_string(&raw).unwrap_or_default();
            return StreamEvent::content(body);
        }
    };
    StreamEvent::new(kind, raw.data)
}

fn tool_data(mut data: Value) -> Value {
    if let Some(name) = data.get("name").and_then(Value::as_str) {
        let display = ui_tool_name(name).to_string();
        data["name"] = Value::String(display);
    }
    data
}

fn tool_end(data: Value) -> StreamEvent {
    let output = data.get("output").and_then(Value::as_str).unwrap_or_default();
    let Some(mut approval) = parse_approval(output) else {
        return StreamEvent::new(StreamEventKind::ToolEnd, tool_data(data));
    };

    let name = data.get("name").and_then(Value::as_str).unwrap_or_default();
    approval.insert("tool_id".into(), data.get("id").cloned().unwrap_or(Value::Null));
    approval.insert("tool_name".into(), json!(ui_tool_name(name)));
    approval.entry("command").or_insert_with(|| json!(""));
    approval.entry("run_on_host").or_insert(json!(false));
    StreamEvent::new(StreamEventKind::ApprovalNeeded, Value::Object(approval))
}

/// Drain a prompt stream through [`normalize`], preserving order. The
/// receiver ends right after `done`.
pub fn bridge(mut stream: PromptStream) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(256);
    spawn_guarded("stream-bridge", async move {
        while let Some(raw) = stream.next().await {
            let event = normalize(raw);
            let done = event.kind == StreamEventKind::Done;
            if tx.send(event).await.is_err() || done {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_extraction() {
        let sentinel = format!(
            "{}{}",
            APPROVAL_PREFIX,
            json!({"type": "approval_required", "approval_id": "a1", "command": "qm stop 100",
                "do_not_retry": true, "target_host": "pve1"})
        );
        let ev = normalize(RawEvent::new(
            "tool_end",
            json!({"id": "call_7", "name": "pulse_control_guest", "output": sentinel, "success": true}),
        ));
        assert_eq!(ev.kind, StreamEventKind::ApprovalNeeded);
        assert_eq!(ev.tool_id(), Some("call_7"));
        assert_eq!(ev.data["tool_name"], "control_guest");
        assert_eq!(ev.data["command"], "qm stop 100");
        assert_eq!(ev.data["run_on_host"], false);
        assert_eq!(ev.data["approval_id"], "a1");
        assert_eq!(ev.data["target_host"], "pve1");
    }

    #[test]
    fn test_plain_tool_end_keeps_output() {
        let ev = normalize(RawEvent::new(
            "tool_end",
            json!({"id": "c1", "name": "pulse_query", "output": "3 nodes online"}),
        ));
        assert_eq!(ev.kind, StreamEventKind::ToolEnd);
        assert_eq!(ev.data["name"], "query");
        assert_eq!(ev.data["output"], "3 nodes online");

        // Broken sentinel stays a normal tool result
        let ev = normalize(RawEvent::new(
            "tool_end",
            json!({"id": "c2", "name": "x", "output": "APPROVAL_REQUIRED: {oops"}),
        ));
        assert_eq!(ev.kind, StreamEventKind::ToolEnd);
    }

    #[test]
    fn test_unknown_events_pass_through_as_content() {
        let raw = RawEvent::new("session.compacted", json!({"n": 1}));
        let ev = normalize(raw.clone());
        assert_eq!(ev.kind, StreamEventKind::Content);
        let body: RawEvent = serde_json::from_str(ev.text().unwrap()).unwrap();
        assert_eq!(body, raw);
    }

    #[test]
    fn test_known_kinds() {
        assert_eq!(normalize(RawEvent::new("thinking", json!("..."))).kind, StreamEventKind::Thinking);
        assert_eq!(normalize(RawEvent::new("done", Value::Null)).kind, StreamEventKind::Done);
        let ev = normalize(RawEvent::new("content", json!("hi")));
        assert_eq!(ev.text(), Some("hi"));
        assert_eq!(
            serde_json::to_value(StreamEvent::done()).unwrap(),
            json!({"type": "done", "data": null})
        );
    }

    #[test]
    fn test_ui_tool_name() {
        assert_eq!(ui_tool_name("pulse_run_command"), "run_command");
        assert_eq!(ui_tool_name("patrol_report_finding"), "patrol_report_finding");
    }
}
