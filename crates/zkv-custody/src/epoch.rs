//! Custodian key epochs.
//!
//! The table is append-only. An epoch's state is never stored; it is
//! computed from the clock each time it is asked for:
//!
//! ```text
//! latest epoch:      Active (until a successor is appended)
//! superseded epoch:  Deprecated ──grace_until──▶ Expired
//! ```
//!
//! Exactly one epoch is current whenever the table is non-empty. The
//! latest epoch's `valid_until` is its planned rotation time; passing it
//! makes [`EpochTable::rotation_due`] report true but changes no state.
//! Rotating closes the previous epoch at the rotation time, so its
//! envelopes are honored for exactly one grace period afterwards.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use zkv_core::config::CustodyConfig;
use zkv_core::{Clock, VaultError, VaultResult};
use zkv_crypto::WrapPublicKey;

pub type EpochId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianEpoch {
    pub id: EpochId,
    pub public_key: WrapPublicKey,
    pub created_at: u64,
    /// Planned rotation time; once superseded, when it stopped accepting enrollments
    pub valid_until: u64,
    /// End of the window in which existing envelopes are honored once superseded
    pub grace_until: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochState {
    Active,
    Deprecated,
    Expired,
}

impl std::fmt::Display for EpochState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EpochState::Active => "active",
            EpochState::Deprecated => "deprecated",
            EpochState::Expired => "expired",
        };
        f.pad(s)
    }
}

fn compute_state(epoch: &CustodianEpoch, is_latest: bool, now: u64) -> EpochState {
    if is_latest {
        EpochState::Active
    } else if now < epoch.grace_until {
        EpochState::Deprecated
    } else {
        EpochState::Expired
    }
}

pub struct EpochTable {
    epochs: RwLock<Vec<CustodianEpoch>>,
    clock: Arc<dyn Clock>,
    lifetime_secs: u64,
    grace_secs: u64,
}

impl EpochTable {
    pub fn new(config: &CustodyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            epochs: RwLock::new(Vec::new()),
            clock,
            lifetime_secs: config.epoch_lifetime_secs,
            grace_secs: config.grace_period_secs,
        }
    }

    /// Rebuild a table from stored epochs; ids must be strictly increasing.
    pub fn from_epochs(
        epochs: Vec<CustodianEpoch>,
        config: &CustodyConfig,
        clock: Arc<dyn Clock>,
    ) -> VaultResult<Self> {
        if epochs.windows(2).any(|w| w[0].id >= w[1].id) {
            return Err(VaultError::Config(
                "epoch table ids are not strictly increasing".into(),
            ));
        }
        let table = Self::new(config, clock);
        *table.epochs.write() = epochs;
        Ok(table)
    }

    /// Load the table from `path`; a missing file is an empty table.
    pub fn load(path: &Path, config: &CustodyConfig, clock: Arc<dyn Clock>) -> VaultResult<Self> {
        if !path.exists() {
            return Ok(Self::new(config, clock));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading epoch table: {}", path.display()))?;
        let epochs: Vec<CustodianEpoch> = serde_json::from_str(&content)
            .with_context(|| format!("parsing epoch table: {}", path.display()))?;
        Self::from_epochs(epochs, config, clock)
    }

    /// Write the table atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> VaultResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating epoch dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&*self.epochs.read())
            .context("serializing epoch table")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("writing epoch table temp: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming epoch table: {}", path.display()))?;
        Ok(())
    }

    /// Append a new epoch for `public_key` and close the previous one.
    pub fn rotate(&self, public_key: WrapPublicKey) -> CustodianEpoch {
        let now = self.clock.now();
        let mut epochs = self.epochs.write();

        if let Some(previous) = epochs.last_mut() {
            previous.valid_until = now;
            previous.grace_until = now.saturating_add(self.grace_secs);
        }

        let valid_until = now.saturating_add(self.lifetime_secs);
        let epoch = CustodianEpoch {
            id: epochs.last().map(|e| e.id + 1).unwrap_or(1),
            public_key,
            created_at: now,
            valid_until,
            grace_until: valid_until.saturating_add(self.grace_secs),
        };
        epochs.push(epoch.clone());
        info!(epoch = epoch.id, valid_until, "custodian epoch rotated");
        epoch
    }

    pub fn get(&self, id: EpochId) -> Option<CustodianEpoch> {
        self.epochs.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn state_of(&self, id: EpochId) -> VaultResult<EpochState> {
        let now = self.clock.now();
        let epochs = self.epochs.read();
        let latest = epochs.last().map(|e| e.id);
        epochs
            .iter()
            .find(|e| e.id == id)
            .map(|e| compute_state(e, Some(e.id) == latest, now))
            .ok_or_else(|| VaultError::NotFound(format!("custodian epoch {id}")))
    }

    /// The epoch new enrollments must target: always the latest one.
    pub fn active(&self) -> VaultResult<CustodianEpoch> {
        self.epochs
            .read()
            .last()
            .cloned()
            .ok_or(VaultError::NoActiveEpoch)
    }

    /// Whether the active epoch reaches its planned rotation time within
    /// `lead_secs` (or there is no epoch at all).
    pub fn rotation_due(&self, lead_secs: u64) -> bool {
        let now = self.clock.now();
        self.epochs
            .read()
            .last()
            .map_or(true, |e| now.saturating_add(lead_secs) >= e.valid_until)
    }

    /// Every epoch with its current state, oldest first.
    pub fn epochs(&self) -> Vec<(CustodianEpoch, EpochState)> {
        let now = self.clock.now();
        let epochs = self.epochs.read();
        let latest = epochs.last().map(|e| e.id);
        epochs
            .iter()
            .map(|e| (e.clone(), compute_state(e, Some(e.id) == latest, now)))
            .collect()
    }

    pub fn expired_ids(&self) -> Vec<EpochId> {
        self.epochs()
            .into_iter()
            .filter(|(_, state)| *state == EpochState::Expired)
            .map(|(e, _)| e.id)
            .collect()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.epochs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.read().is_empty()
    }
}
