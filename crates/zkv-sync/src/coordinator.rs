//! Naming-Layer Sync Coordinator
//!
//! Publish is optimistic concurrency: re-resolve the entity, compare its
//! published sequence with what the caller last observed, and publish at
//! exactly `current + 1` only if they match. A mismatch is a conflict and
//! hands the winning record back to the caller; conflicts are never retried
//! here. Transient unavailability is retried with exponential backoff up to
//! a bounded number of attempts.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};
use zkv_core::config::NamingConfig;
use zkv_core::{Clock, VaultError, VaultResult};
use zkv_crypto::SigningKeypair;
use zkv_records::{Freshness, Sequence, SequenceTracker};

use crate::naming::{NamingLayer, SignedRecord};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base · 2^(attempt−1), capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&NamingConfig> for RetryPolicy {
    fn from(config: &NamingConfig) -> Self {
        Self {
            max_attempts: config.max_publish_attempts.max(1),
            base_delay: config.backoff_base(),
            max_delay: config.backoff_max(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&NamingConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub name: String,
    pub sequence: Sequence,
    pub expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    pub record: SignedRecord,
    /// Whether this sequence moved past what this process had seen
    pub freshness: Freshness,
}

impl ResolvedRecord {
    pub fn sequence(&self) -> Sequence {
        self.record.sequence
    }

    pub fn value(&self) -> &[u8] {
        &self.record.value
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.freshness, Freshness::Stale { .. })
    }
}

/// One entry of a batch publish.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub keypair: SigningKeypair,
    pub value: Vec<u8>,
    pub observed: Sequence,
}

pub struct SyncCoordinator {
    naming: Arc<dyn NamingLayer>,
    tracker: Arc<SequenceTracker>,
    retry: RetryPolicy,
    record_ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl SyncCoordinator {
    pub fn new(naming: Arc<dyn NamingLayer>, config: &NamingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            naming,
            tracker: Arc::new(SequenceTracker::new()),
            retry: RetryPolicy::from(config),
            record_ttl_secs: config.record_ttl_secs,
            clock,
        }
    }

    /// Share a (possibly persisted) sequence tracker.
    pub fn with_tracker(mut self, tracker: Arc<SequenceTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tracker(&self) -> &Arc<SequenceTracker> {
        &self.tracker
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Resolve with retry; verifies the signature and the name binding.
    async fn resolve_raw(&self, name: &str) -> VaultResult<Option<SignedRecord>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.naming.resolve(name).await {
                Ok(Some(record)) => {
                    if record.name != name {
                        return Err(VaultError::InvalidSignature(name.to_string()));
                    }
                    record.verify()?;
                    return Ok(Some(record));
                }
                Ok(None) => return Ok(None),
                Err(VaultError::PublishUnavailable { reason, .. }) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(VaultError::PublishUnavailable {
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(name, attempt, ?delay, %reason, "resolve failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve `name` to its current record. `NotFound` if never published.
    pub async fn resolve(&self, name: &str) -> VaultResult<ResolvedRecord> {
        let record = self
            .resolve_raw(name)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("no record published for {name}")))?;
        let freshness = self.tracker.observe(name, record.sequence);
        Ok(ResolvedRecord { record, freshness })
    }

    /// Currently published sequence for `name` (0 if never published).
    pub async fn current_sequence(&self, name: &str) -> VaultResult<Sequence> {
        Ok(self
            .resolve_raw(name)
            .await?
            .map(|r| r.sequence)
            .unwrap_or(Sequence::UNPUBLISHED))
    }

    /// Publish `value` for the entity signed by `keypair`.
    ///
    /// `observed` is the sequence the caller based its change on
    /// (`Sequence::UNPUBLISHED` for a new entity).
    pub async fn publish(
        &self,
        keypair: &SigningKeypair,
        value: Vec<u8>,
        observed: Sequence,
    ) -> VaultResult<PublishResult> {
        let name = keypair.public().to_hex();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let reason = match self.try_publish(keypair, &name, &value, observed).await {
                Ok(result) => return Ok(result),
                Err(VaultError::PublishUnavailable { reason, .. }) => reason,
                Err(e) => return Err(e),
            };

            if attempt >= self.retry.max_attempts {
                warn!(name = %name, attempts = attempt, %reason, "naming layer unavailable, giving up");
                return Err(VaultError::PublishUnavailable {
                    attempts: attempt,
                    reason,
                });
            }
            let delay = self.retry.delay(attempt);
            warn!(name = %name, attempt, ?delay, %reason, "publish failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_publish(
        &self,
        keypair: &SigningKeypair,
        name: &str,
        value: &[u8],
        observed: Sequence,
    ) -> VaultResult<PublishResult> {
        let current = self.naming.resolve(name).await?;
        if let Some(record) = &current {
            record.verify()?;
        }
        let current_seq = current.as_ref().map(|r| r.sequence).unwrap_or(Sequence::UNPUBLISHED);

        if current_seq != observed {
            debug!(name, expected = %observed, found = %current_seq, "publish conflict on re-resolve");
            return Err(match current {
                Some(record) => {
                    self.tracker.observe(name, record.sequence);
                    record.conflict(observed)
                }
                // Caller claims a sequence that was never published.
                None => VaultError::StaleSequence {
                    name: name.to_string(),
                    sequence: observed.get(),
                    last_seen: 0,
                },
            });
        }

        let next = current_seq.next()?;
        let expires_at = self.clock.now().saturating_add(self.record_ttl_secs);
        let record = SignedRecord::sign(keypair, value.to_vec(), next, expires_at);

        match self.naming.publish(record).await {
            Ok(()) => {
                self.tracker.observe(name, next);
                info!(name, sequence = %next, expires_at, "record published");
                Ok(PublishResult {
                    name: name.to_string(),
                    sequence: next,
                    expires_at,
                })
            }
            // Lost the race between re-resolve and publish.
            Err(VaultError::PublishConflict(mut conflict)) => {
                conflict.expected = observed.get();
                if let Ok(seq) = Sequence::new(conflict.sequence) {
                    self.tracker.observe(name, seq);
                }
                Err(VaultError::PublishConflict(conflict))
            }
            Err(e) => Err(e),
        }
    }

    /// Publish several records concurrently. Each succeeds or fails on its
    /// own; the result vector is in input order.
    pub async fn publish_batch(&self, items: Vec<BatchItem>) -> Vec<VaultResult<PublishResult>> {
        let results = join_all(
            items
                .iter()
                .map(|item| self.publish(&item.keypair, item.value.clone(), item.observed)),
        )
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(total = results.len(), failed, "batch publish partially failed");
        } else {
            debug!(total = results.len(), "batch publish complete");
        }
        results
    }
}
