//! Best-effort cleanup: unpins that may fail without failing the operation
//! that produced them. Failures are logged and queued for a later retry;
//! after `max_attempts` the address is dropped and logged at error level.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::content::ContentStore;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingUnpin {
    address: String,
    attempts: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub unpinned: usize,
    pub requeued: usize,
    pub abandoned: Vec<String>,
}

pub struct CleanupQueue {
    store: Arc<dyn ContentStore>,
    pending: Mutex<VecDeque<PendingUnpin>>,
    max_attempts: u32,
}

impl CleanupQueue {
    pub fn new(store: Arc<dyn ContentStore>, max_attempts: u32) -> Self {
        Self {
            store,
            pending: Mutex::new(VecDeque::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Try to unpin now; on failure queue for retry. Never returns an error.
    pub async fn unpin_best_effort(&self, address: &str) {
        if let Err(e) = self.store.unpin(address).await {
            warn!(%address, error = %e, "unpin failed, queued for retry");
            self.pending.lock().push_back(PendingUnpin {
                address: address.to_string(),
                attempts: 1,
            });
        }
    }

    pub fn enqueue(&self, address: impl Into<String>) {
        self.pending.lock().push_back(PendingUnpin {
            address: address.into(),
            attempts: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Retry everything currently queued once.
    pub async fn drain(&self) -> CleanupReport {
        let batch: Vec<PendingUnpin> = self.pending.lock().drain(..).collect();
        let mut report = CleanupReport::default();

        for mut item in batch {
            match self.store.unpin(&item.address).await {
                Ok(()) => report.unpinned += 1,
                Err(e) => {
                    item.attempts += 1;
                    if item.attempts >= self.max_attempts {
                        error!(address = %item.address, attempts = item.attempts, error = %e, "giving up on unpin");
                        report.abandoned.push(item.address);
                    } else {
                        warn!(address = %item.address, attempts = item.attempts, error = %e, "unpin retry failed");
                        report.requeued += 1;
                        self.pending.lock().push_back(item);
                    }
                }
            }
        }

        if report.unpinned > 0 || report.requeued > 0 || !report.abandoned.is_empty() {
            info!(
                unpinned = report.unpinned,
                requeued = report.requeued,
                abandoned = report.abandoned.len(),
                "cleanup pass complete"
            );
        }
        report
    }
}
