//! Provisioning progress of create commands that are still running.
//!
//! The reported status of a cluster is otherwise derived from the host, which
//! cannot tell that a cluster is still being placed or rolled out. Entries
//! live as long as the command that tracks them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::status::ProvisioningState;

/// One tracked cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub cluster: String,
    pub state: ProvisioningState,
}

/// Shared table of in-progress provisioning states.
#[derive(Debug, Clone, Default)]
pub struct ProgressBoard {
    entries: Arc<Mutex<HashMap<String, ProvisioningState>>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ProvisioningState>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start tracking `cluster` in `state`. The entry is removed when the
    /// returned handle is dropped.
    pub fn track(&self, cluster: &str, state: ProvisioningState) -> ProgressEntry {
        self.entries().insert(cluster.to_string(), state);
        ProgressEntry {
            cluster: cluster.to_string(),
            board: self.clone(),
        }
    }

    /// Current state of `cluster`, if a command is tracking it.
    pub fn get(&self, cluster: &str) -> Option<ProvisioningState> {
        self.entries().get(cluster).copied()
    }

    /// Every tracked cluster, sorted by name.
    pub fn snapshot(&self) -> Vec<Progress> {
        let mut progress: Vec<Progress> = self
            .entries()
            .iter()
            .map(|(cluster, state)| Progress {
                cluster: cluster.clone(),
                state: *state,
            })
            .collect();
        progress.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        progress
    }
}

/// Tracking handle for one cluster.
#[derive(Debug)]
pub struct ProgressEntry {
    cluster: String,
    board: ProgressBoard,
}

impl ProgressEntry {
    pub fn advance(&self, state: ProvisioningState) {
        self.board.entries().insert(self.cluster.clone(), state);
    }
}

impl Drop for ProgressEntry {
    fn drop(&mut self) {
        self.board.entries().remove(&self.cluster);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_advances_and_clears_on_drop() {
        let board = ProgressBoard::new();
        let entry = board.track("beta", ProvisioningState::Placing);
        let _other = board.track("alpha", ProvisioningState::Updating);
        assert_eq!(board.get("beta"), Some(ProvisioningState::Placing));

        entry.advance(ProvisioningState::Creating);
        assert_eq!(
            board.snapshot(),
            vec![
                Progress {
                    cluster: "alpha".to_string(),
                    state: ProvisioningState::Updating,
                },
                Progress {
                    cluster: "beta".to_string(),
                    state: ProvisioningState::Creating,
                },
            ]
        );

        drop(entry);
        assert_eq!(board.get("beta"), None);
        assert_eq!(board.snapshot().len(), 1);
    }
}
