//! Core types and utilities for the Pulse AI control plane
//!
//! # Modules
//!
//! - `config`: Layered settings (TOML file + `PULSE_AI__*` environment)
//! - `control`: Control level that gates mutating tools
//! - `error`: Error types and Result alias
//! - `lifecycle`: Start/stop state machine shared by long-lived services
//! - `snapshot`: Read-only fleet state consumed by tools, discovery and patrol
//! - `task`: Panic-isolated background workers and cancellation

pub mod config;
pub mod control;
pub mod error;
pub mod lifecycle;
pub mod snapshot;
pub mod task;

// Re-exports
pub use config::Settings;
pub use control::ControlLevel;
pub use error::{Error, Result};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use snapshot::{StateProvider, StateSnapshot};
pub use task::{spawn_guarded, Cancellation};
