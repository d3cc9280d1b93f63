// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock resource manager for testing.
//!
//! Records accepted launches and declined offers instead of talking to a
//! cluster scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Launch, ResourceManager, ResourceManagerError};

/// Resource manager that records calls.
#[derive(Debug, Clone, Default)]
pub struct MockResourceManager {
    accepted: Arc<Mutex<Vec<(String, Vec<Launch>)>>>,
    declined: Arc<Mutex<Vec<String>>>,
    /// If true, every accept fails as if the offer had been rescinded.
    pub rescind_all: bool,
}

impl MockResourceManager {
    /// Create a new mock resource manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock whose accepts always fail.
    pub fn rescinding() -> Self {
        Self {
            rescind_all: true,
            ..Self::default()
        }
    }

    /// Accepted offers with their launches, in call order.
    pub async fn accepted(&self) -> Vec<(String, Vec<Launch>)> {
        self.accepted.lock().await.clone()
    }

    /// Declined offer ids, in call order.
    pub async fn declined(&self) -> Vec<String> {
        self.declined.lock().await.clone()
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn accept(&self, offer_id: &str, launches: &[Launch]) -> Result<(), ResourceManagerError> {
        if self.rescind_all {
            return Err(ResourceManagerError::Rescinded(offer_id.to_string()));
        }
        self.accepted
            .lock()
            .await
            .push((offer_id.to_string(), launches.to_vec()));
        Ok(())
    }

    async fn decline(&self, offer_ids: &[String]) -> Result<(), ResourceManagerError> {
        self.declined.lock().await.extend_from_slice(offer_ids);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_declines() {
        let rm = MockResourceManager::new();
        rm.decline(&["o1".to_string(), "o2".to_string()])
            .await
            .unwrap();
        assert_eq!(rm.declined().await, vec!["o1", "o2"]);
        assert!(rm.accepted().await.is_empty());
    }

    #[tokio::test]
    async fn test_rescinding_rejects_accepts() {
        let rm = MockResourceManager::rescinding();
        let err = rm.accept("o1", &[]).await.unwrap_err();
        assert!(matches!(err, ResourceManagerError::Rescinded(id) if id == "o1"));
    }
}
