//! OpenCode Client
//!
//! Stateless HTTP client for the OpenCode runtime. Session management is
//! plain REST; `prompt_stream` subscribes to the global event stream before
//! posting the prompt, filters events to its own session and translates them
//! into [`RawEvent`]s on a single channel.
//!
//! A polling fallback runs next to the event reader: if the stream has shown
//! no activity after a few seconds it reads the session's messages directly,
//! which covers fast models that finish before their events are delivered.

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use pulse_core::{spawn_guarded, Cancellation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{LlmError, Result};
use crate::model::ModelRef;
use crate::sse::{data_payload, LineBuffer};

/// Request timeout for everything except the event stream
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Runtime session ids carry this prefix; anything else is a Pulse-side id
pub const SESSION_PREFIX: &str = "ses";

pub fn is_runtime_session_id(id: &str) -> bool {
    id.starts_with(SESSION_PREFIX)
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    /// Unix milliseconds
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time: SessionTime,
}

impl Session {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.time.created).single()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.time.updated).single()
    }
}

/// A session message flattened to its text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: String,
    pub content: String,
}

impl Message {
    /// Accepts both `{info, parts}` records and flat `{id, role, content}`
    fn from_value(v: &Value) -> Option<Self> {
        if let Some(info) = v.get("info") {
            return Some(Self {
                id: str_field(info, "id"),
                role: str_field(info, "role"),
                content: text_of_parts(v.get("parts")),
            });
        }
        let role = v.get("role")?.as_str()?.to_string();
        Some(Self {
            id: str_field(v, "id"),
            role,
            content: str_field(v, "content"),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    fn from_tokens(tokens: Option<&Value>) -> Self {
        let get = |k: &str| tokens.and_then(|t| t.get(k)).and_then(Value::as_u64).unwrap_or(0);
        Self {
            input_tokens: get("input"),
            output_tokens: get("output"),
        }
    }

    fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptRequest {
    pub prompt: String,
    /// Reused when it is a runtime session id, otherwise a session is created
    pub session_id: Option<String>,
    /// `provider:model`, `provider/model` or a bare model name
    pub model: Option<String>,
    pub system: Option<String>,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    fn body(&self) -> Value {
        let mut body = json!({
            "parts": [{"type": "text", "text": self.prompt}],
        });
        // Unknown models are left to the runtime default
        if let Some(model) = self.model.as_deref().and_then(ModelRef::parse) {
            body["model"] = model.to_json();
        }
        if let Some(system) = self.system.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        body
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptResponse {
    pub session_id: String,
    pub message: Message,
    pub usage: Usage,
}

/// Answer to one question of a `question` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub id: String,
    pub value: String,
}

/// Event produced by the stream reader, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl RawEvent {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn is_done(&self) -> bool {
        self.kind == "done"
    }
}

/// Timing of the polling fallback
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    /// Quiet period before polling starts
    pub poll_after: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            poll_after: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            poll_attempts: 10,
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    base_url: String,
    http: reqwest::Client,
    /// No overall timeout; the event stream stays open for the whole prompt
    stream_http: reqwest::Client,
    timing: StreamTiming,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?,
            stream_http: reqwest::Client::builder().build()?,
            timing: StreamTiming::default(),
        })
    }

    pub fn with_stream_timing(mut self, timing: StreamTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self.http.get(self.url("/global/health")).send().await?;
        expect_status(resp, "health check", &[200]).await?;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let resp = self.http.get(self.url("/session")).send().await?;
        let resp = expect_status(resp, "list sessions", &[200]).await?;
        Ok(resp.json().await?)
    }

    pub async fn create_session(&self) -> Result<Session> {
        // The runtime insists on a JSON body even when empty
        let resp = self.http.post(self.url("/session")).json(&json!({})).send().await?;
        let resp = expect_status(resp, "create session", &[200, 201]).await?;
        Ok(resp.json().await?)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/session/{}", session_id)))
            .send()
            .await?;
        expect_status(resp, "delete session", &[200, 204]).await?;
        Ok(())
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let resp = self
            .http
            .get(self.url(&format!("/session/{}/message", session_id)))
            .send()
            .await?;
        let resp = expect_status(resp, "get messages", &[200]).await?;
        let raw: Vec<Value> = resp.json().await?;
        Ok(raw.iter().filter_map(Message::from_value).collect())
    }

    /// Use the caller's session when it is a runtime id, else open a new one
    async fn ensure_session(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(id) if is_runtime_session_id(id) => {
                debug!(session_id = %id, "Using existing OpenCode session");
                Ok(id.to_string())
            }
            other => {
                let session = self.create_session().await?;
                debug!(
                    provided = other.unwrap_or(""),
                    session_id = %session.id,
                    "Created OpenCode session"
                );
                Ok(session.id)
            }
        }
    }

    /// Send a prompt and wait for the complete answer
    pub async fn prompt(&self, request: &PromptRequest) -> Result<PromptResponse> {
        let session_id = self.ensure_session(request.session_id.as_deref()).await?;
        let resp = self
            .http
            .post(self.url(&format!("/session/{}/message", session_id)))
            .json(&request.body())
            .send()
            .await?;
        let resp = expect_status(resp, "prompt", &[200]).await?;
        let raw: Value = resp.json().await?;

        let info = raw.get("info").cloned().unwrap_or(Value::Null);
        Ok(PromptResponse {
            session_id,
            message: Message {
                id: str_field(&info, "id"),
                role: str_field(&info, "role"),
                content: text_of_parts(raw.get("parts")),
            },
            usage: Usage::from_tokens(info.get("tokens")),
        })
    }

    /// Send a prompt and stream its events.
    ///
    /// Session creation, the event subscription and the prompt post happen
    /// before this returns, so their failures surface here; later failures
    /// arrive as `error` events. The stream always ends with one `done`.
    pub async fn prompt_stream(&self, request: &PromptRequest) -> Result<PromptStream> {
        let session_id = self.ensure_session(request.session_id.as_deref()).await?;

        // Subscribe first: fast models can finish before a late subscriber attaches
        let events = self
            .stream_http
            .get(self.url("/global/event"))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let events = expect_status(events, "event stream", &[200]).await?;

        let resp = self
            .http
            .post(self.url(&format!("/session/{}/prompt_async", session_id)))
            .json(&request.body())
            .send()
            .await?;
        expect_status(resp, "prompt_async", &[200, 202, 204]).await?;

        let (tx, rx) = mpsc::channel(256);
        let cancel = Cancellation::new();
        let emitter = Arc::new(Emitter::new(tx, cancel.clone()));

        let poller = spawn_guarded(
            "opencode-poll",
            poll_fallback(self.clone(), session_id.clone(), emitter.clone(), cancel.clone()),
        );
        spawn_guarded(
            "opencode-events",
            read_events(events, session_id.clone(), emitter, cancel.clone(), poller),
        );

        Ok(PromptStream {
            session_id,
            events: rx,
            cancel,
        })
    }

    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/session/{}/abort", session_id)))
            .send()
            .await?;
        expect_status(resp, "abort session", &[200, 204]).await?;
        Ok(())
    }

    pub async fn answer_question(&self, question_id: &str, answers: &[QuestionAnswer]) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/question/{}/answer", question_id)))
            .json(&json!({"answers": answers}))
            .send()
            .await?;
        expect_status(resp, "answer question", &[200, 204]).await?;
        Ok(())
    }

    /// Compress the session context when it nears the model limit
    pub async fn summarize_session(&self, session_id: &str) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(&format!("/session/{}/summarize", session_id)))
            .send()
            .await?;
        let resp = expect_status(resp, "summarize session", &[200, 204]).await?;
        json_or_success(resp).await
    }

    pub async fn session_diff(&self, session_id: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!("/session/{}/diff", session_id)))
            .send()
            .await?;
        let resp = expect_status(resp, "get session diff", &[200]).await?;
        Ok(resp.json().await?)
    }

    /// Branch the conversation, optionally at a given message
    pub async fn fork_session(&self, session_id: &str, message_id: Option<&str>) -> Result<Session> {
        let body = match message_id {
            Some(id) => json!({"messageID": id}),
            None => json!({}),
        };
        let resp = self
            .http
            .post(self.url(&format!("/session/{}/fork", session_id)))
            .json(&body)
            .send()
            .await?;
        let resp = expect_status(resp, "fork session", &[200, 201]).await?;
        Ok(resp.json().await?)
    }

    pub async fn revert_session(&self, session_id: &str, message_id: Option<&str>) -> Result<Value> {
        let body = match message_id {
            Some(id) => json!({"messageID": id}),
            None => json!({}),
        };
        let resp = self
            .http
            .post(self.url(&format!("/session/{}/revert", session_id)))
            .json(&body)
            .send()
            .await?;
        let resp = expect_status(resp, "revert session", &[200, 204]).await?;
        json_or_success(resp).await
    }

    pub async fn unrevert_session(&self, session_id: &str) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(&format!("/session/{}/unrevert", session_id)))
            .send()
            .await?;
        let resp = expect_status(resp, "unrevert session", &[200, 204]).await?;
        json_or_success(resp).await
    }

    /// Configured provider names
    pub async fn list_providers(&self) -> Result<Vec<String>> {
        let resp = self.http.get(self.url("/config/providers")).send().await?;
        let resp = expect_status(resp, "list models", &[200]).await?;
        let raw: Value = resp.json().await?;

        let mut providers: Vec<String> = match raw.get("providers") {
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(|p| p.get("id").and_then(Value::as_str).map(String::from))
                .collect(),
            _ => raw.as_object().map(|o| o.keys().cloned().collect()).unwrap_or_default(),
        };
        providers.sort();
        Ok(providers)
    }
}

async fn expect_status(
    resp: reqwest::Response,
    operation: &'static str,
    accepted: &[u16],
) -> Result<reqwest::Response> {
    let status = resp.status();
    if accepted.contains(&status.as_u16()) {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(LlmError::status(operation, status, body))
}

/// Endpoints that answer either a JSON body or nothing at all
async fn json_or_success(resp: reqwest::Response) -> Result<Value> {
    let body = resp.bytes().await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({"success": true}));
    }
    Ok(serde_json::from_slice(&body)?)
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn text_of_parts(parts: Option<&Value>) -> String {
    parts
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

// ============================================================================
// STREAMING
// ============================================================================

/// Events of one streamed prompt. Dropping it stops the background readers.
pub struct PromptStream {
    pub session_id: String,
    events: mpsc::Receiver<RawEvent>,
    cancel: Cancellation,
}

impl PromptStream {
    pub async fn next(&mut self) -> Option<RawEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain until `done`, collecting everything
    pub async fn collect(mut self) -> Vec<RawEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.next().await {
            let done = ev.is_done();
            out.push(ev);
            if done {
                break;
            }
        }
        out
    }
}

impl Drop for PromptStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Single fan-in for the event reader and the poller. Nothing is sent after
/// `done`, and sending `done` stops both producers.
struct Emitter {
    tx: Mutex<Option<mpsc::Sender<RawEvent>>>,
    activity: AtomicBool,
    cancel: Cancellation,
}

impl Emitter {
    fn new(tx: mpsc::Sender<RawEvent>, cancel: Cancellation) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            activity: AtomicBool::new(false),
            cancel,
        }
    }

    fn mark_activity(&self) {
        self.activity.store(true, Ordering::SeqCst);
    }

    fn has_activity(&self) -> bool {
        self.activity.load(Ordering::SeqCst)
    }

    /// Returns false once the stream is closed
    async fn emit(&self, event: RawEvent) -> bool {
        let mut guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        let done = event.is_done();
        let delivered = tx.send(event).await.is_ok();
        if done || !delivered {
            *guard = None;
            self.cancel.cancel();
        }
        delivered && !done
    }

    async fn finish(&self, usage: Usage) {
        self.emit(RawEvent::new("done", json!(usage))).await;
    }
}

/// Per-stream translation state
struct Translator {
    session_id: String,
    /// A text or reasoning delta has arrived for this prompt
    content_seen: bool,
    started_tools: HashSet<String>,
    ended_tools: HashSet<String>,
    usage: Usage,
}

enum Step {
    Skip,
    Emit(Vec<RawEvent>),
    /// Emit, then end the stream
    Finish(Vec<RawEvent>),
}

impl Translator {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            content_seen: false,
            started_tools: HashSet::new(),
            ended_tools: HashSet::new(),
            usage: Usage::default(),
        }
    }

    fn translate(&mut self, data: &str) -> Step {
        let Ok(envelope) = serde_json::from_str::<Value>(data) else {
            return Step::Skip;
        };
        let payload = envelope.get("payload").unwrap_or(&Value::Null);
        let event_type = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        let props = payload.get("properties").unwrap_or(&Value::Null);

        let event_session = props
            .get("sessionID")
            .and_then(Value::as_str)
            .or_else(|| props.pointer("/part/sessionID").and_then(Value::as_str))
            .unwrap_or_default();
        if !event_session.is_empty() && event_session != self.session_id {
            return Step::Skip;
        }

        match event_type {
            "message.part.updated" => self.part_updated(props),
            "session.idle" => self.idle(),
            "session.status" => {
                if props.pointer("/status/type").and_then(Value::as_str) == Some("idle") {
                    self.idle()
                } else {
                    Step::Skip
                }
            }
            "session.error" => {
                let message = props
                    .pointer("/error/data/message")
                    .or_else(|| props.pointer("/error/message"))
                    .or_else(|| props.pointer("/error/name"))
                    .and_then(Value::as_str)
                    .unwrap_or("session error");
                Step::Finish(vec![RawEvent::new("error", json!(message))])
            }
            "question.asked" => Step::Emit(vec![self.question(props)]),
            _ => Step::Skip,
        }
    }

    fn part_updated(&mut self, props: &Value) -> Step {
        let part = props.get("part").unwrap_or(&Value::Null);
        let delta = props.get("delta").and_then(Value::as_str).unwrap_or_default();

        match part.get("type").and_then(Value::as_str).unwrap_or_default() {
            "text" if !delta.is_empty() => {
                self.content_seen = true;
                Step::Emit(vec![RawEvent::new("content", json!(delta))])
            }
            "reasoning" if !delta.is_empty() => {
                self.content_seen = true;
                Step::Emit(vec![RawEvent::new("thinking", json!(delta))])
            }
            "tool" => self.tool_part(part),
            "step-finish" => {
                self.usage.add(Usage::from_tokens(part.get("tokens")));
                match part.get("reason").and_then(Value::as_str).unwrap_or_default() {
                    "stop" | "" => Step::Finish(Vec::new()),
                    _ => Step::Skip,
                }
            }
            _ => Step::Skip,
        }
    }

    /// One `tool_start` and one `tool_end` per call id, whatever the number
    /// of intermediate updates
    fn tool_part(&mut self, part: &Value) -> Step {
        let name = str_field(part, "tool");
        let id = part
            .get("callID")
            .or_else(|| part.get("id"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| name.clone());
        let state = part.get("state").unwrap_or(&Value::Null);
        let status = state.get("status").and_then(Value::as_str).unwrap_or_default();
        let input = state.get("input").cloned().unwrap_or_else(|| json!(name));

        let mut events = Vec::new();
        let start = |events: &mut Vec<RawEvent>, started: &mut HashSet<String>| {
            if started.insert(id.clone()) {
                events.push(RawEvent::new(
                    "tool_start",
                    json!({"id": id, "name": name, "input": input}),
                ));
            }
        };

        match status {
            "pending" | "running" => start(&mut events, &mut self.started_tools),
            "completed" | "error" => {
                start(&mut events, &mut self.started_tools);
                if self.ended_tools.insert(id.clone()) {
                    let success = status == "completed";
                    let output = if success {
                        str_field(state, "output")
                    } else {
                        str_field(state, "error")
                    };
                    events.push(RawEvent::new(
                        "tool_end",
                        json!({
                            "id": id,
                            "name": name,
                            "input": input,
                            "output": output,
                            "success": success,
                        }),
                    ));
                }
            }
            _ => {}
        }

        if events.is_empty() {
            Step::Skip
        } else {
            Step::Emit(events)
        }
    }

    /// Idle before any content is a leftover from an earlier prompt
    fn idle(&self) -> Step {
        if self.content_seen {
            Step::Finish(Vec::new())
        } else {
            debug!(session_id = %self.session_id, "Ignoring idle event before content");
            Step::Skip
        }
    }

    fn question(&self, props: &Value) -> RawEvent {
        let questions: Vec<Value> = props
            .get("questions")
            .and_then(Value::as_array)
            .map(|qs| {
                qs.iter()
                    .map(|q| {
                        let options: Vec<Value> = q
                            .get("options")
                            .and_then(Value::as_array)
                            .map(|opts| {
                                opts.iter()
                                    .map(|o| {
                                        let label = str_field(o, "label");
                                        let value = o
                                            .get("value")
                                            .and_then(Value::as_str)
                                            .map(String::from)
                                            .unwrap_or_else(|| label.clone());
                                        json!({"label": label, "value": value})
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        let kind = if options.is_empty() { "text" } else { "select" };
                        let mut out = json!({
                            "id": str_field(q, "header"),
                            "type": kind,
                            "question": str_field(q, "question"),
                        });
                        if !options.is_empty() {
                            out["options"] = json!(options);
                        }
                        out
                    })
                    .collect()
            })
            .unwrap_or_default();

        RawEvent::new(
            "question",
            json!({
                "question_id": str_field(props, "id"),
                "questions": questions,
                "session_id": self.session_id,
            }),
        )
    }
}

async fn read_events(
    resp: reqwest::Response,
    session_id: String,
    emitter: Arc<Emitter>,
    cancel: Cancellation,
    poller: tokio::task::JoinHandle<()>,
) {
    debug!(session_id = %session_id, "Reading OpenCode event stream");
    let mut translator = Translator::new(session_id.clone());
    let mut lines = LineBuffer::default();
    let mut bytes = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = bytes.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "OpenCode event stream failed");
                emitter.emit(RawEvent::new("error", json!(e.to_string()))).await;
                emitter.finish(translator.usage).await;
                return;
            }
            None => break,
        };

        for line in lines.push(&chunk) {
            let Some(data) = data_payload(&line) else {
                continue;
            };
            match translator.translate(data) {
                Step::Skip => {}
                Step::Emit(events) => {
                    emitter.mark_activity();
                    for ev in events {
                        if !emitter.emit(ev).await {
                            return;
                        }
                    }
                }
                Step::Finish(events) => {
                    for ev in events {
                        emitter.emit(ev).await;
                    }
                    emitter.finish(translator.usage).await;
                    return;
                }
            }
        }
    }

    // Stream closed without a terminal event; let the poller have its turn
    debug!(session_id = %session_id, "OpenCode event stream closed");
    let _ = poller.await;
    emitter.finish(translator.usage).await;
}

async fn poll_fallback(
    client: OpenCodeClient,
    session_id: String,
    emitter: Arc<Emitter>,
    cancel: Cancellation,
) {
    let timing = client.timing;
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(timing.poll_after) => {}
    }
    if emitter.has_activity() {
        return;
    }
    debug!(session_id = %session_id, "No stream activity, polling messages");

    for _ in 0..timing.poll_attempts {
        if emitter.has_activity() || cancel.is_cancelled() {
            return;
        }
        match client.get_messages(&session_id).await {
            Ok(messages) => {
                let answer = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "assistant" && !m.content.is_empty());
                if let Some(answer) = answer {
                    info!(session_id = %session_id, "Got response via polling");
                    if emitter.emit(RawEvent::new("content", json!(answer.content))).await {
                        emitter.finish(Usage::default()).await;
                    }
                    return;
                }
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "Poll fallback failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(timing.poll_interval) => {}
        }
    }

    if !emitter.has_activity() {
        warn!(session_id = %session_id, "Polling timed out without a response");
        emitter.finish(Usage::default()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(kind: &str, props: Value) -> String {
        json!({"directory": "/srv", "payload": {"type": kind, "properties": props}}).to_string()
    }

    fn emitted(step: Step) -> Vec<RawEvent> {
        match step {
            Step::Emit(evs) => evs,
            Step::Finish(_) => panic!("unexpected finish"),
            Step::Skip => Vec::new(),
        }
    }

    #[test]
    fn test_foreign_session_events_are_dropped() {
        let mut t = Translator::new("ses_a".into());
        let data = envelope(
            "message.part.updated",
            json!({"part": {"type": "text", "sessionID": "ses_b"}, "delta": "hi"}),
        );
        assert!(matches!(t.translate(&data), Step::Skip));

        let data = envelope(
            "message.part.updated",
            json!({"part": {"type": "text", "sessionID": "ses_a"}, "delta": "hi"}),
        );
        assert_eq!(emitted(t.translate(&data)), vec![RawEvent::new("content", json!("hi"))]);
    }

    #[test]
    fn test_idle_before_content_is_stale() {
        let mut t = Translator::new("ses_a".into());
        let idle = envelope("session.idle", json!({"sessionID": "ses_a"}));
        assert!(matches!(t.translate(&idle), Step::Skip));

        let reasoning = envelope(
            "message.part.updated",
            json!({"part": {"type": "reasoning"}, "delta": "hmm"}),
        );
        assert_eq!(emitted(t.translate(&reasoning))[0].kind, "thinking");
        assert!(matches!(t.translate(&idle), Step::Finish(_)));

        let status = envelope("session.status", json!({"status": {"type": "idle"}}));
        assert!(matches!(t.translate(&status), Step::Finish(_)));
    }

    #[test]
    fn test_step_finish_reasons() {
        let mut t = Translator::new("ses_a".into());
        let calls = envelope(
            "message.part.updated",
            json!({"part": {"type": "step-finish", "reason": "tool-calls", "tokens": {"input": 10, "output": 2}}}),
        );
        assert!(matches!(t.translate(&calls), Step::Skip));
        let stop = envelope(
            "message.part.updated",
            json!({"part": {"type": "step-finish", "reason": "stop", "tokens": {"input": 5, "output": 3}}}),
        );
        assert!(matches!(t.translate(&stop), Step::Finish(_)));
        assert_eq!(
            t.usage,
            Usage {
                input_tokens: 15,
                output_tokens: 5
            }
        );
    }

    #[test]
    fn test_tool_events_pair_once_per_call() {
        let mut t = Translator::new("ses_a".into());
        let part = |status: &str| {
            envelope(
                "message.part.updated",
                json!({"part": {"type": "tool", "callID": "c1", "tool": "pulse_query",
                    "state": {"status": status, "input": {"action": "health"}, "output": "ok"}}}),
            )
        };

        let first = emitted(t.translate(&part("pending")));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, "tool_start");
        assert!(emitted(t.translate(&part("running"))).is_empty());

        let end = emitted(t.translate(&part("completed")));
        assert_eq!(end.len(), 1);
        assert_eq!(end[0].kind, "tool_end");
        assert_eq!(end[0].data["id"], "c1");
        assert_eq!(end[0].data["output"], "ok");
        assert!(emitted(t.translate(&part("completed"))).is_empty());

        // A completion seen without its start still yields both, in order
        let orphan = envelope(
            "message.part.updated",
            json!({"part": {"type": "tool", "callID": "c2", "tool": "pulse_get_metrics",
                "state": {"status": "error", "error": "boom"}}}),
        );
        let evs = emitted(t.translate(&orphan));
        assert_eq!(
            evs.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>(),
            vec!["tool_start", "tool_end"]
        );
        assert_eq!(evs[1].data["success"], false);
        assert_eq!(evs[1].data["output"], "boom");
    }

    #[test]
    fn test_question_translation() {
        let mut t = Translator::new("ses_a".into());
        let data = envelope(
            "question.asked",
            json!({
                "id": "q1",
                "sessionID": "ses_a",
                "questions": [
                    {"question": "Which node?", "header": "node", "options": [{"label": "pve1"}, {"label": "pve2", "value": "n2"}]},
                    {"question": "Why?", "header": "why"}
                ]
            }),
        );
        let ev = emitted(t.translate(&data)).remove(0);
        assert_eq!(ev.kind, "question");
        assert_eq!(ev.data["question_id"], "q1");
        assert_eq!(ev.data["session_id"], "ses_a");
        let qs = ev.data["questions"].as_array().unwrap();
        assert_eq!(qs[0]["type"], "select");
        assert_eq!(qs[0]["id"], "node");
        assert_eq!(qs[0]["options"][0]["value"], "pve1");
        assert_eq!(qs[0]["options"][1]["value"], "n2");
        assert_eq!(qs[1]["type"], "text");
        assert!(qs[1].get("options").is_none());
    }

    #[test]
    fn test_prompt_body() {
        let body = PromptRequest::new("hello")
            .with_model("anthropic:claude-3-5-haiku")
            .with_system("be brief")
            .body();
        assert_eq!(body["parts"][0], json!({"type": "text", "text": "hello"}));
        assert_eq!(body["model"]["providerID"], "anthropic");
        assert_eq!(body["system"], "be brief");

        let body = PromptRequest::new("hi").with_model("mystery-model").body();
        assert!(body.get("model").is_none());
    }

    #[test]
    fn test_message_shapes() {
        let nested = json!({"info": {"id": "m1", "role": "assistant"},
            "parts": [{"type": "text", "text": "a"}, {"type": "tool"}, {"type": "text", "text": "b"}]});
        let m = Message::from_value(&nested).unwrap();
        assert_eq!(m.content, "ab");
        assert_eq!(m.role, "assistant");

        let flat = json!({"id": "m2", "role": "user", "content": "hey"});
        assert_eq!(Message::from_value(&flat).unwrap().content, "hey");
        assert!(Message::from_value(&json!({"x": 1})).is_none());
    }

    #[test]
    fn test_session_id_validation() {
        assert!(is_runtime_session_id("ses_123"));
        assert!(!is_runtime_session_id("chat-42"));
    }
}
