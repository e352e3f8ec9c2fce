//! Patrol run history
//!
//! Bounded list of completed patrol runs, newest first, persisted to
//! `<data_dir>/patrol_history.json`.

use chrono::{DateTime, Utc};
use pulse_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const HISTORY_FILE: &str = "patrol_history.json";
pub const MAX_PATROL_RUNS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatrolRunStatus {
    #[default]
    Healthy,
    IssuesFound,
    Critical,
    Error,
}

/// Resources covered by a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCounts {
    pub nodes: usize,
    pub guests: usize,
    pub docker: usize,
    pub storage: usize,
    pub pbs: usize,
    pub hosts: usize,
    pub kubernetes: usize,
    pub pmg: usize,
}

impl ResourceCounts {
    pub fn total(&self) -> usize {
        self.nodes
            + self.guests
            + self.docker
            + self.storage
            + self.pbs
            + self.hosts
            + self.kubernetes
            + self.pmg
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolRunRecord {
    pub id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// `full` or `scoped`
    #[serde(rename = "type")]
    pub run_type: String,
    pub trigger: String,
    pub resources: ResourceCounts,
    pub new_findings: usize,
    pub existing_findings: usize,
    pub resolved_findings: usize,
    pub rejected_findings: usize,
    pub critical: usize,
    pub warning: usize,
    pub finding_ids: Vec<String>,
    pub error_count: usize,
    pub status: PatrolRunStatus,
    pub summary: String,
    /// Scrubbed model output
    pub ai_analysis: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: usize,
}

pub struct PatrolHistoryStore {
    runs: RwLock<VecDeque<PatrolRunRecord>>,
    path: Option<PathBuf>,
    capacity: usize,
}

impl Default for PatrolHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PatrolHistoryStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(VecDeque::new()),
            path: None,
            capacity: MAX_PATROL_RUNS,
        }
    }

    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(HISTORY_FILE);
        let mut runs: VecDeque<PatrolRunRecord> = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };
        runs.truncate(MAX_PATROL_RUNS);
        debug!(count = runs.len(), path = %path.display(), "Loaded patrol history");
        Ok(Self {
            runs: RwLock::new(runs),
            path: Some(path),
            capacity: MAX_PATROL_RUNS,
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Record a run, dropping the oldest beyond capacity
    pub async fn add(&self, run: PatrolRunRecord) {
        let mut runs = self.runs.write().await;
        runs.push_front(run);
        runs.truncate(self.capacity);

        let Some(path) = &self.path else {
            return;
        };
        let body = match serde_json::to_vec_pretty(&*runs) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to encode patrol history");
                return;
            }
        };
        let tmp = path.with_extension("json.tmp");
        let written = async {
            tokio::fs::write(&tmp, &body).await?;
            tokio::fs::rename(&tmp, path).await
        };
        if let Err(e) = written.await {
            warn!(error = %e, path = %path.display(), "Failed to persist patrol history");
        }
    }

    /// Newest first; `limit == 0` returns everything
    pub async fn list(&self, limit: usize) -> Vec<PatrolRunRecord> {
        let runs = self.runs.read().await;
        let take = if limit == 0 { runs.len() } else { limit };
        runs.iter().take(take).cloned().collect()
    }

    pub async fn last(&self) -> Option<PatrolRunRecord> {
        self.runs.read().await.front().cloned()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str) -> PatrolRunRecord {
        PatrolRunRecord {
            id: id.to_string(),
            run_type: "full".to_string(),
            completed_at: Some(Utc::now()),
            summary: "All healthy".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_newest_first_and_bounded() {
        let store = PatrolHistoryStore::new().with_capacity(3);
        for i in 0..5 {
            store.add(run(&format!("r{}", i))).await;
        }
        let ids: Vec<String> = store.list(0).await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r4", "r3", "r2"]);
        assert_eq!(store.list(1).await.len(), 1);
        assert_eq!(store.last().await.unwrap().id, "r4");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PatrolHistoryStore::open(dir.path()).await.unwrap();
            let mut r = run("r1");
            r.status = PatrolRunStatus::IssuesFound;
            r.resources.guests = 4;
            store.add(r).await;
        }
        let store = PatrolHistoryStore::open(dir.path()).await.unwrap();
        let last = store.last().await.unwrap();
        assert_eq!(last.status, PatrolRunStatus::IssuesFound);
        assert_eq!(last.resources.total(), 4);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(HISTORY_FILE)).unwrap()).unwrap();
        assert_eq!(raw[0]["type"], "full");
        assert_eq!(raw[0]["status"], "issues_found");
    }
}
