//! Pending approvals for commands proposed at the `controlled` level

use chrono::{DateTime, Utc};
use pulse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

pub use pulse_core::control::APPROVAL_PREFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub tool: String,
    pub command: String,
    pub target_type: String,
    pub target_id: String,
    pub target_name: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Fields of a new approval request
#[derive(Debug, Clone, Default)]
pub struct ApprovalRequest {
    pub tool: String,
    pub command: String,
    pub target_type: String,
    pub target_id: String,
    pub target_name: String,
    pub context: String,
}

#[derive(Default)]
pub struct ApprovalStore {
    records: RwLock<HashMap<String, ApprovalRecord>>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, request: ApprovalRequest) -> ApprovalRecord {
        let record = ApprovalRecord {
            id: Uuid::new_v4().to_string(),
            tool: request.tool,
            command: request.command,
            target_type: request.target_type,
            target_id: request.target_id,
            target_name: request.target_name,
            context: request.context,
            created_at: Utc::now(),
            status: ApprovalStatus::Pending,
            decided_at: None,
        };
        info!(approval_id = %record.id, tool = %record.tool, target = %record.target_name, "Approval requested");
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    pub async fn get(&self, id: &str) -> Option<ApprovalRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Pending records, oldest first
    pub async fn list_pending(&self) -> Vec<ApprovalRecord> {
        let mut pending: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub async fn approve(&self, id: &str) -> Result<ApprovalRecord> {
        self.decide(id, ApprovalStatus::Approved).await
    }

    pub async fn deny(&self, id: &str) -> Result<ApprovalRecord> {
        self.decide(id, ApprovalStatus::Denied).await
    }

    async fn decide(&self, id: &str, status: ApprovalStatus) -> Result<ApprovalRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("approval {}", id)))?;
        if record.status != ApprovalStatus::Pending {
            return Err(Error::conflict(format!("approval {} already decided", id)));
        }
        record.status = status;
        record.decided_at = Some(Utc::now());
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_approve_once() {
        let store = ApprovalStore::new();
        let rec = store
            .create(ApprovalRequest {
                tool: "pulse_run_command".into(),
                command: "systemctl restart nginx".into(),
                ..Default::default()
            })
            .await;

        assert_eq!(store.list_pending().await.len(), 1);
        let approved = store.approve(&rec.id).await.unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert!(store.list_pending().await.is_empty());
        assert!(matches!(store.deny(&rec.id).await, Err(Error::Conflict(_))));
        assert!(matches!(store.approve("nope").await, Err(Error::NotFound(_))));
    }
}
