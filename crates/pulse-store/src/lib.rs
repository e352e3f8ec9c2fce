//! pulse-store: on-disk state owned by the AI control plane
//!
//! - `crypto`: AES-256-GCM sealer with a per-data-directory key
//! - `knowledge`: per-guest notes with encryption and legacy migration
//! - `findings`: dedup-keyed findings with dismissal and suppression
//! - `history`: bounded patrol run history

pub mod crypto;
pub mod findings;
pub mod history;
pub mod knowledge;

pub use crypto::{CryptoError, Sealer};
pub use findings::{
    generate_finding_id, DismissReason, Finding, FindingCategory, FindingSeverity, FindingStatus,
    FindingsStore, FindingsSummary,
};
pub use history::{PatrolHistoryStore, PatrolRunRecord, PatrolRunStatus, ResourceCounts};
pub use knowledge::{GuestKnowledge, KnowledgeStore, Note, NoteCategory};
