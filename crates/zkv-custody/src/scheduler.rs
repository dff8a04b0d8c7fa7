//! Periodic re-sign/republish of every enrolled entity.
//!
//! Each entity runs as its own task with its own interval, so one slow or
//! failing entity never delays another. A cycle is bounded by a timeout; a
//! failure is logged and retried on the entity's next tick.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zkv_core::config::CustodyConfig;
use zkv_core::VaultError;

use crate::custodian::CustodianService;
use crate::enroll::{needs_rewrap, Enrollment};
use crate::epoch::{EpochState, EpochTable};

/// Outcome of one entity's cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Republished { sequence: u64 },
    /// Enrollment's epoch is past its grace window; the owner must re-enroll
    Expired,
    Failed { reason: String },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub republished: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub expired: Vec<String>,
    /// Enrollments on a superseded, still-honored epoch; the owner should re-wrap
    pub needs_rewrap: Vec<String>,
    /// The active epoch is at or near its planned rotation time
    pub rotation_due: bool,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.expired.is_empty()
    }
}

pub struct RepublishScheduler {
    custodian: Arc<dyn CustodianService>,
    table: Arc<EpochTable>,
    enrollments: Vec<Enrollment>,
    interval: Duration,
    cycle_timeout: Duration,
    rotation_lead_secs: u64,
}

impl RepublishScheduler {
    pub fn new(
        custodian: Arc<dyn CustodianService>,
        table: Arc<EpochTable>,
        enrollments: Vec<Enrollment>,
        config: &CustodyConfig,
    ) -> Self {
        Self {
            custodian,
            table,
            enrollments,
            interval: config.republish_interval(),
            cycle_timeout: config.cycle_timeout(),
            rotation_lead_secs: config.rotation_lead_secs,
        }
    }

    pub fn enrollments(&self) -> &[Enrollment] {
        &self.enrollments
    }

    /// One bounded cycle for one entity.
    pub async fn republish_one(&self, enrollment: &Enrollment) -> CycleOutcome {
        cycle(self.custodian.as_ref(), enrollment, self.cycle_timeout).await
    }

    /// Run one cycle for every enrollment concurrently.
    pub async fn run_cycle(&self) -> CycleReport {
        let outcomes = join_all(self.enrollments.iter().map(|e| self.republish_one(e))).await;

        let mut report = CycleReport::default();
        for (enrollment, outcome) in self.enrollments.iter().zip(outcomes) {
            let name = enrollment.name();
            match outcome {
                CycleOutcome::Expired => {
                    report.expired.push(name);
                    continue;
                }
                CycleOutcome::Republished { .. } => report.republished.push(name.clone()),
                CycleOutcome::Failed { reason } => report.failed.push((name.clone(), reason)),
            }
            if matches!(needs_rewrap(&self.table, enrollment), Ok(true)) {
                report.needs_rewrap.push(name);
            }
        }
        report.rotation_due = self.table.rotation_due(self.rotation_lead_secs);
        if report.rotation_due {
            warn!("active custodian epoch is due for rotation");
        }

        let retired = self.custodian.retire_expired();
        info!(
            republished = report.republished.len(),
            failed = report.failed.len(),
            expired = report.expired.len(),
            needs_rewrap = report.needs_rewrap.len(),
            retired = retired.len(),
            "republish cycle complete"
        );
        report
    }

    /// Run per-entity republish loops until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        for enrollment in self.enrollments.iter().cloned() {
            let custodian = Arc::clone(&self.custodian);
            let cancel = cancel.clone();
            let interval = self.interval;
            let timeout = self.cycle_timeout;

            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if cycle(custodian.as_ref(), &enrollment, timeout).await == CycleOutcome::Expired {
                                // Nothing more this custodian can do until re-enrollment.
                                break;
                            }
                        }
                    }
                }
            });
        }

        let custodian = Arc::clone(&self.custodian);
        let retire_cancel = cancel.clone();
        let interval = self.interval;
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = retire_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        custodian.retire_expired();
                    }
                }
            }
        });

        info!(entities = self.enrollments.len(), interval = ?self.interval, "republish scheduler started");
        cancel.cancelled().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("republish task panicked: {e}");
            }
        }
        info!("republish scheduler stopped");
    }
}

async fn cycle(custodian: &dyn CustodianService, enrollment: &Enrollment, timeout: Duration) -> CycleOutcome {
    let entity = enrollment.entity.fingerprint();

    if let Ok(EpochState::Expired) = custodian.epoch_state(enrollment.epoch_id) {
        warn!(%entity, epoch = enrollment.epoch_id, "enrollment epoch expired; owner must re-enroll");
        return CycleOutcome::Expired;
    }

    match tokio::time::timeout(timeout, custodian.republish(enrollment)).await {
        Ok(Ok(result)) => {
            debug!(%entity, sequence = %result.sequence, "republished");
            CycleOutcome::Republished {
                sequence: result.sequence.get(),
            }
        }
        Ok(Err(VaultError::EpochExpired(epoch))) => {
            warn!(%entity, epoch, "enrollment epoch expired; owner must re-enroll");
            CycleOutcome::Expired
        }
        Ok(Err(e)) if e.is_recoverable() => {
            warn!(%entity, error = %e, "republish failed, retrying next cycle");
            CycleOutcome::Failed { reason: e.to_string() }
        }
        Ok(Err(e)) => {
            error!(%entity, error = %e, "republish failed");
            CycleOutcome::Failed { reason: e.to_string() }
        }
        Err(_) => {
            warn!(%entity, ?timeout, "republish cycle timed out");
            CycleOutcome::Failed {
                reason: format!("timed out after {timeout:?}"),
            }
        }
    }
}
