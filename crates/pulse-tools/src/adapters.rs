//! Ready-made provider implementations
//!
//! `FindingsStore` backs the user-facing findings tools directly, and
//! [`SnapshotProviders`] derives alerts, backups and storage from whatever
//! state provider is wired.

use async_trait::async_trait;
use pulse_core::snapshot::{Alert, CephCluster, PbsBackup, PbsInstance, PveBackups, Storage};
use pulse_core::{Error, Result, StateProvider};
use pulse_store::{DismissReason, Finding, FindingSeverity, FindingsStore};
use std::sync::Arc;

use crate::providers::{AlertProvider, BackupProvider, FindingsManager, FindingsProvider, StorageProvider};

#[async_trait]
impl FindingsProvider for FindingsStore {
    async fn active_findings(&self) -> Vec<Finding> {
        self.get_active(FindingSeverity::Info).await
    }

    async fn dismissed_findings(&self) -> Vec<Finding> {
        self.get_dismissed().await
    }
}

#[async_trait]
impl FindingsManager for FindingsStore {
    async fn resolve_finding(&self, finding_id: &str, note: &str) -> Result<()> {
        if !self.resolve_with_reason(finding_id, note).await {
            return Err(Error::not_found(format!(
                "finding {} not found or already resolved",
                finding_id
            )));
        }
        Ok(())
    }

    async fn dismiss_finding(&self, finding_id: &str, reason: &str, note: &str) -> Result<()> {
        let reason: DismissReason = reason.parse()?;
        if !self.dismiss(finding_id, reason, note).await {
            return Err(Error::not_found(format!("finding {} not found", finding_id)));
        }
        Ok(())
    }
}

/// Alert, backup and storage views over a state provider
pub struct SnapshotProviders {
    state: Arc<dyn StateProvider>,
}

impl SnapshotProviders {
    pub fn new(state: Arc<dyn StateProvider>) -> Self {
        Self { state }
    }
}

impl AlertProvider for SnapshotProviders {
    fn active_alerts(&self) -> Vec<Alert> {
        self.state.snapshot().active_alerts
    }
}

impl BackupProvider for SnapshotProviders {
    fn backups(&self) -> PveBackups {
        self.state.snapshot().pve_backups
    }

    fn pbs_backups(&self) -> Vec<PbsBackup> {
        self.state.snapshot().pbs_backups
    }

    fn pbs_instances(&self) -> Vec<PbsInstance> {
        self.state.snapshot().pbs_instances
    }
}

impl StorageProvider for SnapshotProviders {
    fn storage(&self) -> Vec<Storage> {
        self.state.snapshot().storage
    }

    fn ceph_clusters(&self) -> Vec<CephCluster> {
        self.state.snapshot().ceph_clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_store::{generate_finding_id, FindingCategory};

    fn finding() -> Finding {
        Finding {
            id: generate_finding_id("vm-100", "performance", "high-cpu"),
            key: "high-cpu".into(),
            severity: FindingSeverity::Warning,
            category: FindingCategory::Performance,
            resource_id: "vm-100".into(),
            title: "High CPU".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_store_as_findings_manager() {
        let store = FindingsStore::new();
        let f = finding();
        let id = f.id.clone();
        assert!(store.add(f).await);

        assert_eq!(FindingsProvider::active_findings(&store).await.len(), 1);
        assert!(store.dismiss_finding(&id, "bogus", "x").await.is_err());
        store
            .dismiss_finding(&id, "expected_behavior", "nightly batch")
            .await
            .unwrap();
        assert!(FindingsProvider::active_findings(&store).await.is_empty());
        assert_eq!(store.dismissed_findings().await.len(), 1);

        assert!(FindingsManager::resolve_finding(&store, "missing", "done").await.is_err());
    }
}
