//! Per-entity monotonic sequence numbers
//!
//! Sequences are kept within 2^53 − 1 so they survive a round trip through
//! any JSON consumer that stores numbers as doubles.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zkv_core::{VaultError, VaultResult};

pub const MAX_SAFE_SEQUENCE: u64 = (1 << 53) - 1;

/// A validated sequence number. `0` means "never published".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Sequence(u64);

impl Sequence {
    pub const UNPUBLISHED: Sequence = Sequence(0);

    pub fn new(value: u64) -> VaultResult<Self> {
        if value > MAX_SAFE_SEQUENCE {
            return Err(VaultError::SequenceOverflow(value));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// The sequence a successful publish moves to: exactly one more.
    pub fn next(&self) -> VaultResult<Self> {
        Self::new(self.0.saturating_add(1))
    }

    pub fn is_unpublished(&self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<u64> for Sequence {
    type Error = VaultError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Sequence> for u64 {
    fn from(seq: Sequence) -> u64 {
        seq.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// At or below what was already seen; callers ignore it.
    Stale { last_seen: Sequence },
}

/// Last observed sequence per naming-layer name.
///
/// Shared across tasks. A stale read here is harmless: the naming layer's
/// own sequence check is authoritative.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    seen: RwLock<HashMap<String, Sequence>>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: HashMap<String, Sequence>) -> Self {
        Self {
            seen: RwLock::new(snapshot),
        }
    }

    pub fn last_seen(&self, name: &str) -> Option<Sequence> {
        self.seen.read().get(name).copied()
    }

    /// Record `sequence` for `name` if it moves forward.
    pub fn observe(&self, name: &str, sequence: Sequence) -> Freshness {
        let mut seen = self.seen.write();
        match seen.get(name) {
            Some(&last) if sequence <= last => Freshness::Stale { last_seen: last },
            _ => {
                seen.insert(name.to_string(), sequence);
                Freshness::Fresh
            }
        }
    }

    /// Like [`observe`](Self::observe) but a stale sequence is an error.
    pub fn check(&self, name: &str, sequence: Sequence) -> VaultResult<Sequence> {
        match self.observe(name, sequence) {
            Freshness::Fresh => Ok(sequence),
            Freshness::Stale { last_seen } => Err(VaultError::StaleSequence {
                name: name.to_string(),
                sequence: sequence.get(),
                last_seen: last_seen.get(),
            }),
        }
    }

    pub fn forget(&self, name: &str) {
        self.seen.write().remove(name);
    }

    pub fn snapshot(&self) -> HashMap<String, Sequence> {
        self.seen.read().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }
}
