//! pulse-patrol: scheduled LLM patrol over the fleet
//!
//! A [`PatrolEngine`] run builds a seed context from the current
//! [`pulse_core::StateSnapshot`], lets the model investigate through the
//! tool executor, and records what it reports as findings. Deterministic
//! [`Signal`]s mined from the tool outputs catch what the model missed: an
//! evaluation pass gets a second look, and anything still unreported is
//! filed directly. Findings not re-reported on a clean full run are
//! resolved.
//!
//! [`PatrolScheduler`] drives runs on an interval and on demand.

pub mod adapter;
pub mod config;
pub mod engine;
pub mod providers;
pub mod runner;
pub mod scheduler;
pub mod seed;
pub mod signals;
pub mod thinking;

pub use adapter::{ReportedFinding, RunFindingCreator};
pub use config::{AnalysisScope, PatrolConfig};
pub use engine::{error_finding_id, PatrolEngine};
pub use providers::{
    CapacityForecast, Correlation, CostTracker, FleetIntelligence, GuestIntel, GuestIntelProvider,
    ResourceChange, TokenBudget,
};
pub use runner::{OpenCodeRunner, PatrolRequest, PatrolRunner, PatrolStream, ToolCallRecord, Transcript};
pub use scheduler::PatrolScheduler;
pub use signals::{Signal, SignalThresholds, SignalType};
pub use thinking::clean_thinking_tokens;
