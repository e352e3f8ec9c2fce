//! Fleet snapshot fed in by the host product
//!
//! The collectors live outside this service; they write the current
//! snapshot as JSON and every read here picks up the latest file. A missing
//! or unreadable file keeps the last good snapshot.

use pulse_core::{StateProvider, StateSnapshot};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

pub struct SnapshotFile {
    path: PathBuf,
    last: RwLock<StateSnapshot>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: RwLock::new(StateSnapshot::default()),
        }
    }

    fn read(&self) -> Option<StateSnapshot> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot file yet");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read snapshot file");
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Invalid snapshot file, keeping last snapshot");
                None
            }
        }
    }
}

impl StateProvider for SnapshotFile {
    fn snapshot(&self) -> StateSnapshot {
        if let Some(fresh) = self.read() {
            let mut last = self.last.write().unwrap_or_else(|e| e.into_inner());
            *last = fresh.clone();
            return fresh;
        }
        self.last.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_last_good_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = SnapshotFile::new(&path);
        assert!(provider.snapshot().nodes.is_empty());

        std::fs::write(&path, r#"{"nodes": [{"id": "node/pve1", "name": "pve1"}]}"#).unwrap();
        assert_eq!(provider.snapshot().nodes[0].name, "pve1");

        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(provider.snapshot().nodes.len(), 1);
    }
}
