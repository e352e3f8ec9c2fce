//! Streaming tests against an in-process OpenCode stand-in

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use pulse_core::snapshot::Guest;
use pulse_core::{ControlLevel, StateSnapshot};
use pulse_llm::{
    bridge, OpenCodeClient, PromptRequest, QuestionAnswer, StreamEvent, StreamEventKind, StreamTiming,
};
use pulse_tools::{Providers, ToolExecutor};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Clone)]
struct Runtime {
    events: broadcast::Sender<String>,
    /// Event payloads sent when a prompt arrives; `{sid}` is the session id
    script: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Value>>,
    sessions_created: Arc<AtomicUsize>,
    answers: Arc<Mutex<Vec<Value>>>,
    prompt_status: StatusCode,
}

impl Runtime {
    fn new(script: Vec<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            script: Arc::new(Mutex::new(script)),
            messages: Arc::new(Mutex::new(json!([]))),
            sessions_created: Arc::new(AtomicUsize::new(0)),
            answers: Arc::new(Mutex::new(Vec::new())),
            prompt_status: StatusCode::NO_CONTENT,
        }
    }
}

async fn create_session(State(rt): State<Runtime>) -> Json<Value> {
    let n = rt.sessions_created.fetch_add(1, Ordering::SeqCst);
    Json(json!({"id": format!("ses_{}", n), "title": "", "time": {"created": 1_700_000_000_000i64, "updated": 1_700_000_000_000i64}}))
}

async fn global_events(State(rt): State<Runtime>) -> Response {
    let rx = rt.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(line) => Some((Ok::<_, Infallible>(format!("data: {}\n\n", line)), rx)),
            Err(_) => None,
        }
    });
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn prompt_async(State(rt): State<Runtime>, Path(id): Path<String>) -> StatusCode {
    if rt.prompt_status.is_success() {
        for line in rt.script.lock().unwrap().iter() {
            let _ = rt.events.send(line.replace("{sid}", &id));
        }
    }
    rt.prompt_status
}

async fn prompt_sync(Path(id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    let text = body["parts"][0]["text"].as_str().unwrap_or_default().to_string();
    Json(json!({
        "info": {"id": "msg_1", "sessionID": id, "role": "assistant", "tokens": {"input": 12, "output": 4}},
        "parts": [{"type": "step-start"}, {"type": "text", "text": "echo: "}, {"type": "text", "text": text}]
    }))
}

async fn messages(State(rt): State<Runtime>) -> Json<Value> {
    Json(rt.messages.lock().unwrap().clone())
}

async fn answer(State(rt): State<Runtime>, Json(body): Json<Value>) -> StatusCode {
    rt.answers.lock().unwrap().push(body);
    StatusCode::OK
}

async fn start(rt: Runtime) -> OpenCodeClient {
    let app = Router::new()
        .route("/global/health", get(|| async { "ok" }))
        .route("/global/event", get(global_events))
        .route("/session", post(create_session))
        .route("/session/:id/message", post(prompt_sync).get(messages))
        .route("/session/:id/prompt_async", post(prompt_async))
        .route("/session/:id/summarize", post(|| async { StatusCode::NO_CONTENT.into_response() }))
        .route("/question/:id/answer", post(answer))
        .with_state(rt);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    OpenCodeClient::new(format!("http://{}/", addr)).unwrap()
}

fn part(session: &str, part: Value, delta: Option<&str>) -> String {
    let mut part = part;
    part["sessionID"] = json!(session);
    let mut props = json!({"part": part});
    if let Some(d) = delta {
        props["delta"] = json!(d);
    }
    json!({"directory": "/srv", "payload": {"type": "message.part.updated", "properties": props}}).to_string()
}

fn session_event(kind: &str, session: &str) -> String {
    json!({"payload": {"type": kind, "properties": {"sessionID": session}}}).to_string()
}

async fn drain(rx: &mut tokio::sync::mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    let collect = async {
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect).await.unwrap();
    out
}

/// Approval sentinel exactly as a mutating tool produces it at `controlled`
async fn controlled_tool_output() -> String {
    let state = StateSnapshot {
        vms: vec![Guest {
            id: "pve/qemu/100".into(),
            vmid: 100,
            name: "web".into(),
            node: "pve1".into(),
            guest_type: "qemu".into(),
            status: "running".into(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let exec = ToolExecutor::new(Providers {
        state: Some(Arc::new(state)),
        ..Default::default()
    });
    exec.set_control_level(ControlLevel::Controlled).await;
    exec.execute_tool("pulse_control_guest", json!({"guest_id": "100", "action": "stop"}))
        .await
        .unwrap()
        .text_content()
}

#[tokio::test]
async fn test_stream_is_filtered_translated_and_bridged() {
    let sentinel = controlled_tool_output().await;
    let script = vec![
        part("ses_other", json!({"type": "text"}), Some("NOT OURS")),
        // Stale idle from before this prompt
        session_event("session.idle", "{sid}"),
        part("{sid}", json!({"type": "reasoning"}), Some("checking nodes")),
        part(
            "{sid}",
            json!({"type": "tool", "callID": "c1", "tool": "pulse_query", "state": {"status": "pending"}}),
            None,
        ),
        part(
            "{sid}",
            json!({"type": "tool", "callID": "c1", "tool": "pulse_query", "state": {"status": "completed", "output": "all good"}}),
            None,
        ),
        part(
            "{sid}",
            json!({"type": "tool", "callID": "c2", "tool": "pulse_control_guest", "state": {"status": "running"}}),
            None,
        ),
        part(
            "{sid}",
            json!({"type": "tool", "callID": "c2", "tool": "pulse_control_guest", "state": {"status": "completed", "output": sentinel}}),
            None,
        ),
        part("{sid}", json!({"type": "step-finish", "reason": "tool-calls"}), None),
        part("{sid}", json!({"type": "text"}), Some("Hello")),
        part("{sid}", json!({"type": "text"}), Some(" world")),
        part(
            "{sid}",
            json!({"type": "step-finish", "reason": "stop", "tokens": {"input": 100, "output": 20}}),
            None,
        ),
        part("{sid}", json!({"type": "text"}), Some("after done")),
    ];
    let client = start(Runtime::new(script)).await;

    let stream = client.prompt_stream(&PromptRequest::new("check the fleet")).await.unwrap();
    assert!(stream.session_id.starts_with("ses_"));
    let events = drain(&mut bridge(stream)).await;

    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    use StreamEventKind::*;
    assert_eq!(
        kinds,
        vec![Thinking, ToolStart, ToolEnd, ToolStart, ApprovalNeeded, Content, Content, Done]
    );

    assert_eq!(events[1].data["name"], "query");
    assert_eq!(events[2].data["output"], "all good");

    // Exactly one approval, tied to the call that produced it
    let approval = &events[4];
    assert_eq!(approval.tool_id(), Some("c2"));
    assert_eq!(approval.data["tool_name"], "control_guest");
    assert!(approval.data["command"].as_str().unwrap().contains("qm stop 100"));
    assert!(approval.data["approval_id"].as_str().is_some());

    let text: String = events.iter().filter_map(|e| match e.kind {
        Content => e.text(),
        _ => None,
    }).collect();
    assert_eq!(text, "Hello world");
    assert_eq!(events[7].data, json!({"input_tokens": 100, "output_tokens": 20}));
}

#[tokio::test]
async fn test_poll_fallback_when_stream_is_silent() {
    let rt = Runtime::new(Vec::new());
    *rt.messages.lock().unwrap() = json!([
        {"info": {"id": "m1", "role": "user"}, "parts": [{"type": "text", "text": "hi"}]},
        {"info": {"id": "m2", "role": "assistant"}, "parts": [{"type": "text", "text": "polled answer"}]}
    ]);
    let client = start(rt).await.with_stream_timing(StreamTiming {
        poll_after: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        poll_attempts: 5,
    });

    let events = client
        .prompt_stream(&PromptRequest::new("hi"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, "content");
    assert_eq!(events[0].data, json!("polled answer"));
    assert!(events[1].is_done());
}

#[tokio::test]
async fn test_poll_gives_up_with_done() {
    let client = start(Runtime::new(Vec::new())).await.with_stream_timing(StreamTiming {
        poll_after: Duration::from_millis(20),
        poll_interval: Duration::from_millis(10),
        poll_attempts: 3,
    });
    let events = client
        .prompt_stream(&PromptRequest::new("hi"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events.len(), 1);
    assert!(events[0].is_done());
}

#[tokio::test]
async fn test_line_larger_than_one_mebibyte() {
    let big = "y".repeat(1024 * 1024 + 512 * 1024);
    let script = vec![
        part("{sid}", json!({"type": "text"}), Some(&big)),
        session_event("session.idle", "{sid}"),
    ];
    let client = start(Runtime::new(script)).await;
    let events = client
        .prompt_stream(&PromptRequest::new("dump"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events[0].data.as_str().unwrap().len(), big.len());
    assert!(events.last().unwrap().is_done());
}

#[tokio::test]
async fn test_runtime_session_ids_are_reused() {
    let rt = Runtime::new(vec![session_event("session.error", "{sid}")]);
    let created = rt.sessions_created.clone();
    let client = start(rt).await;

    let stream = client
        .prompt_stream(&PromptRequest::new("x").with_session("ses_existing"))
        .await
        .unwrap();
    assert_eq!(stream.session_id, "ses_existing");
    let events = stream.collect().await;
    assert_eq!(events[0].kind, "error");
    assert!(events[1].is_done());
    assert_eq!(created.load(Ordering::SeqCst), 0);

    // Pulse-side ids are not runtime sessions
    let stream = client
        .prompt_stream(&PromptRequest::new("x").with_session("chat-42"))
        .await
        .unwrap();
    assert_ne!(stream.session_id, "chat-42");
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_prompt_async_rejection_is_an_error() {
    let mut rt = Runtime::new(Vec::new());
    rt.prompt_status = StatusCode::INTERNAL_SERVER_ERROR;
    let client = start(rt).await;
    let err = client.prompt_stream(&PromptRequest::new("x")).await.err().unwrap();
    assert!(err.to_string().contains("prompt_async failed: status 500"));
}

#[tokio::test]
async fn test_sync_prompt_and_session_endpoints() {
    let rt = Runtime::new(Vec::new());
    let answers = rt.answers.clone();
    let client = start(rt).await;

    client.health().await.unwrap();
    let resp = client.prompt(&PromptRequest::new("ping")).await.unwrap();
    assert_eq!(resp.message.content, "echo: ping");
    assert_eq!(resp.message.role, "assistant");
    assert_eq!(resp.usage.input_tokens, 12);
    assert_eq!(resp.usage.output_tokens, 4);

    assert_eq!(client.summarize_session(&resp.session_id).await.unwrap(), json!({"success": true}));

    client
        .answer_question(
            "q1",
            &[QuestionAnswer {
                id: "node".into(),
                value: "pve1".into(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(
        answers.lock().unwrap()[0],
        json!({"answers": [{"id": "node", "value": "pve1"}]})
    );
}
