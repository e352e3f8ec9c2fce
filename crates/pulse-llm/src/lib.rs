//! pulse-llm: the LLM runtime side of the Pulse AI agent
//!
//! # Modules
//!
//! - `client`: OpenCode REST client and streamed prompts (SSE + polling fallback)
//! - `bridge`: normalization of stream events into the public event schema
//! - `sidecar`: child-process supervisor for the runtime
//! - `model`: `provider:model` parsing and provider name mapping
//! - `sse`: line framing for the event stream

pub mod bridge;
pub mod client;
pub mod error;
pub mod model;
pub mod sidecar;
pub mod sse;

pub use bridge::{bridge, normalize, ui_tool_name, StreamEvent, StreamEventKind};
pub use client::{
    Message, OpenCodeClient, PromptRequest, PromptResponse, PromptStream, QuestionAnswer, RawEvent,
    Session, StreamTiming, Usage,
};
pub use error::{LlmError, Result};
pub use model::ModelRef;
pub use sidecar::{
    ChildProcess, LaunchSpec, Launcher, ProcessLauncher, Sidecar, SidecarConfig, SidecarStatus,
};
