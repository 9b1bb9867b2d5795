//! Serializes read-modify-write cycles per Ops Manager project.
//!
//! The locks only exclude tasks within this process. Two operator instances working on the same
//! project can still overwrite each other's changes.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Identifies a project. Project names are only unique within an organization.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProjectKey {
    pub project_name: String,
    pub org_id: String,
}

impl ProjectKey {
    pub fn new(project_name: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            org_id: org_id.into(),
        }
    }
}

/// One mutex per project, created on first use.
///
/// Entries live until they are [evicted](LockRegistry::evict), which should happen when the
/// project is deleted. Clones share the same locks.
#[derive(Clone, Debug, Default)]
pub struct LockRegistry {
    locks: Arc<Mutex<HashMap<ProjectKey, Arc<Mutex<()>>>>>,
}

impl LockRegistry {
    /// Waits until the lock of `key` is free and takes it. It is released when the guard drops.
    pub async fn lock(&self, key: &ProjectKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Forgets the lock of `key`. Tasks holding or waiting for it are not affected.
    pub async fn evict(&self, key: &ProjectKey) {
        if self.locks.lock().await.remove(key).is_some() {
            tracing::debug!(
                project.name = %key.project_name,
                org.id = %key.org_id,
                "evicted project lock"
            );
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
