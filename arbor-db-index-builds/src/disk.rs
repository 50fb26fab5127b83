//! Periodic disk-space monitoring
//!
//! A background loop samples available disk space and force-aborts every
//! active build when it drops below the configured floor. The check is cheap
//! and silent while the registry is empty.

use crate::coordinator::IndexBuildsCoordinator;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Source of the available-space sample (external collaborator)
#[async_trait]
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes currently available to the storage engine
    async fn available_bytes(&self) -> Result<i64>;
}

/// Fixed-value probe for tests and embedded deployments
#[derive(Debug, Clone, Default)]
pub struct FixedDiskSpace {
    available: Arc<RwLock<i64>>,
}

impl FixedDiskSpace {
    /// Probe reporting `available` bytes
    pub fn new(available: i64) -> Self {
        Self {
            available: Arc::new(RwLock::new(available)),
        }
    }

    /// Change the reported value
    pub fn set_available(&self, available: i64) {
        *self.available.write() = available;
    }
}

#[async_trait]
impl DiskSpaceProbe for FixedDiskSpace {
    async fn available_bytes(&self) -> Result<i64> {
        Ok(*self.available.read())
    }
}

/// Spawn the monitor loop. Abort the returned handle to stop it.
pub fn spawn_disk_space_monitor(
    coordinator: Arc<IndexBuildsCoordinator>,
    probe: Arc<dyn DiskSpaceProbe>,
    interval: Duration,
) -> JoinHandle<()> {
    let required = coordinator.config().min_available_disk_bytes;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let available = match probe.available_bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, "Disk space probe failed");
                    continue;
                }
            };
            if available < required {
                coordinator
                    .abort_all_for_disk_space(available, required)
                    .await;
            }
        }
    })
}
